pub mod embed_error;

pub use embed_error::{classify, codes, EmbedError, EmbedResult};
