//! CLI commands implementation

pub mod compact;
pub mod init;
pub mod manifests;
pub mod query;
pub mod snapshot;
pub mod status;
pub mod validate;

pub use compact::*;
pub use init::*;
pub use manifests::*;
pub use query::*;
pub use snapshot::*;
pub use status::*;
pub use validate::*;
