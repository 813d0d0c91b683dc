pub mod complete;
pub mod decode;

pub use complete::{Completion, CompletionRequest, CompletionResponse, complete, trim_completion};
pub use decode::{DecodedToken, GreedyDecoder, Seq2SeqModel, TokenId, Tokenizer};
