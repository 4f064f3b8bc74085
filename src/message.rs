/// Marker trait for payloads that can flow through the graph.
///
/// Fan-out to several downstream edges clones the payload, so `Clone` is part
/// of the contract. Blanket-implemented; user types need nothing special.
pub trait Message: Send + Clone + 'static {}

impl<T: Send + Clone + 'static> Message for T {}
