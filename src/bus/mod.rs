//! Virtual audio bus
//!
//! A fixed-format loopback device joining producers and consumers that run
//! on independent clocks. Sessions attach through [`pcm`] endpoints; the
//! relay between a reader and a writer goes through a [`queue::FrameQueue`].

pub mod format;
pub mod loopback;
pub mod pcm;
pub mod queue;
pub mod session;

pub use format::BusFormat;
pub use loopback::{BusChannel, LoopbackBus, DEFAULT_BUS_CARD};
pub use pcm::{
    AlsaPcm, BufferProfile, PcmError, PcmOpenOptions, PcmReader, PcmWriter, TeeWriter,
};
pub use queue::{FrameQueue, Pop, QueueStats, RateAdjust, MAX_QUEUE_CAPACITY};
pub use session::{StreamDirection, StreamSession};
