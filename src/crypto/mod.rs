//! Payload sealing.
//!
//! Every record payload is compressed, then encrypted, then encoded as
//! printable text before it reaches a shard file:
//! - LZ4 compression (size-prepended block)
//! - AES-256-GCM under a fresh per-record data key
//! - the data key wrapped with RSA-OAEP (SHA-256) under the store public key
//! - standard base64 so the sealed text never contains a comma
//!
//! Opening reverses all of it and needs the private key.

mod keys;
mod pipeline;

pub use keys::KeyPair;
pub use pipeline::{Sealer, SEAL_VERSION};
