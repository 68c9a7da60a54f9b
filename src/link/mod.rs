// AutoFollow — point-to-point link layer (stop-and-wait over unreliable datagrams).

pub mod node;
pub mod packet;
pub mod transport;

pub use node::LinkNode;
pub use packet::Packet;
pub use transport::{LinkHandler, Transport};
