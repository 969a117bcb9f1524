#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_long_first_doc_paragraph)]

mod blobs;
mod buffer;
mod cache;
mod entry;
mod invalids;
mod io;

pub mod cipher;
pub mod encoder;
pub mod error;
pub mod store;

pub use cipher::{Cipher, XorCipher};
pub use encoder::{BincodeEncoder, Encoder};
pub use io::Mode;
pub use store::{Options, Store, Value};
