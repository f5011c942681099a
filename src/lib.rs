//! A message-oriented, selectively reliable datagram transport over UDP.
//!
//! Applications write messages into a [bundle::Bundle], which streams them
//!  into as many MTU-sized [packet::Packet]s as it takes, and hand the bundle
//!  to a [nub::Nub] for transmission. The hub runs single-threaded: one
//!  socket, one timer queue, and all handlers called inline with mutable
//!  access to the hub, so there is no locking anywhere on the hot path.
//!
//! Reliability is per message, not per connection. Reliable traffic to a
//!  peer flows over a [channel::Channel] with a selective-repeat send
//!  window; lost packets are detected through ack gaps and either resent
//!  directly or piggybacked onto the next outgoing packet. Reliable traffic
//!  without a channel falls back to once-off delivery with receipt-based
//!  deduplication. Oversized bundles fragment into sequenced packet chains
//!  and reassemble on the far side.
//!
//! NB: the hub and everything hanging off it is deliberately `!Send`. Run
//!  one hub per thread (or several via child hubs) and keep all protocol
//!  state inside it.

pub mod bundle;
pub mod channel;
pub mod condemned;
pub mod config;
pub mod endpoint;
pub mod err_report;
pub mod error;
pub mod filter;
pub mod fragment;
pub mod interface;
pub mod nub;
pub mod packet;
pub mod seq;
pub mod test_util;
pub mod timer;

pub use bundle::{Bundle, ReliableType};
pub use channel::{Channel, ChannelId, ChannelPtr};
pub use config::{ChannelCategory, ChannelTuning, NubConfig};
pub use endpoint::{bind, DatagramSocket};
pub use error::{NetworkError, Reason};
pub use filter::{AesGcmFilter, NoFilter, PacketFilter};
pub use interface::{
    IncomingMessage, InterfaceElement, MessageHandler, MessageId, ReplyId, ReplyMessageHandler,
    TimerExpiryHandler,
};
pub use nub::{ChannelFinder, Nub};
pub use seq::SeqNum;
pub use timer::TimerId;
