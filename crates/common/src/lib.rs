// fieldnotes-common: shared note types and the replicated note document

pub mod crdt;
pub mod protocol;
pub mod types;
