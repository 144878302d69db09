pub mod tables;
pub mod state;
pub mod cipher;
pub mod keystore;
pub mod crypto;
pub mod codec;
pub mod group;

pub use state::CodecState;
pub use cipher::{Cipher, Direction};
pub use keystore::{DirKeyStore, DummyKeyStore, Key, KeyStore, MemoryKeyStore};
pub use codec::{CodecError, CodecOptions, Collector, Decoder, Encoder, MessageSink, ReceivedMessage};
pub use group::GroupWriter;
