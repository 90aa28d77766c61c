//! Clip recording
//!
//! [`RecordingController`] owns one task per recording source; tasks read
//! encoded samples from the shared camera and write them through a
//! [`ContainerFactory`].

pub mod container;
pub mod controller;
pub mod webm;

pub use container::{ContainerFactory, ContainerWriter, WebmContainerFactory};
pub use controller::{FinishedRecording, RecordingController};
