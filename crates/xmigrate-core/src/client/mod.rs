//! Server clients.
//!
//! [`RestClient`] is the contract the engine consumes. [`XnatClient`] speaks
//! the XNAT REST API over HTTP; [`InMemoryServer`] keeps a hierarchy in
//! process for tests and rehearsals.

mod memory;
mod traits;
mod xnat;

pub use memory::{Failure, InMemoryServer, Mutation, Operation};
pub use traits::{ByteStream, DynRestClient, EntityPayload, RemoteEntity, RestClient, UploadReceipt};
pub use xnat::XnatClient;
