#[macro_use]
mod macros;

pub mod buffer;
pub mod channel;
pub mod channelizer;
pub mod dsp;
pub mod heap;
pub mod llc;
pub mod mac;
pub mod net;
pub mod phy;
pub mod queue;
pub mod radio;
pub mod schedule;
pub mod seq;
pub mod snapshot;
pub mod stats;
pub mod sync;
pub mod synthesizer;
pub mod time;
pub mod timer;
pub mod wire;
