pub mod admission;
pub mod event;
pub mod node;
pub mod pod;
pub mod quantity;
pub mod reservation;

pub use admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, PatchOperation};
pub use event::Event;
pub use node::{Node, NodeStatus, TaintSpec};
pub use pod::{Container, Namespace, ObjectMeta, PodSpec, PodStatus, PodTask, TolerationSpec};
pub use reservation::{Reservation, ResourceReservation};
