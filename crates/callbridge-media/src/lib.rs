pub mod codec;
pub mod frame_buffer;
pub mod player;
pub mod utterance;
pub mod wav;

pub use codec::{TelephonyTranscoder, linear_to_telephony, telephony_to_linear};
pub use frame_buffer::{FrameBuffer, ReadyChunk};
pub use player::{ReplyPlayer, outbound_chunks};
pub use utterance::{AggregatorOutput, UtteranceAggregator};
