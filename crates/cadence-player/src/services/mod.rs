//! Services wiring the audio pipeline into the player.

pub mod player;
