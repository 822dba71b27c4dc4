// Parcel document engine: the resident document store, the relational
// mirror, the reconcile bridge between them and the request coordinator.

pub mod coordinator;
pub mod doc_store;
pub mod mirror;
pub mod reconcile;
