//! Channel layout remapping and downmixing.
//!
//! A [`Remapper`] holds one row of weights per output speaker. Each input
//! speaker is routed to the first group of output speakers that exists in the
//! target layout; groups of two split the signal at -3 dB.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use cadence_core::{Channel, Error, Layout, Result, StdLayout};
use std::f32::consts::FRAC_1_SQRT_2;
use tracing::trace;

/// Where a speaker's signal goes when the target layout lacks it, in order of
/// preference.
fn routes(channel: Channel) -> &'static [&'static [Channel]] {
    use Channel::{
        Bc, Bl, Br, Fc, Fl, Flc, Fr, Frc, Lfe, Sl, Sr, Tbc, Tbl, Tbr, Tc, Tfc, Tfl, Tfr, Unknown,
    };
    match channel {
        Fl => &[&[Fl], &[Fc]],
        Fr => &[&[Fr], &[Fc]],
        Fc => &[&[Fc], &[Fl, Fr]],
        Lfe => &[&[Lfe]],
        Bl => &[&[Bl], &[Sl], &[Fl], &[Fc]],
        Br => &[&[Br], &[Sr], &[Fr], &[Fc]],
        Sl => &[&[Sl], &[Bl], &[Fl], &[Fc]],
        Sr => &[&[Sr], &[Br], &[Fr], &[Fc]],
        Bc => &[&[Bc], &[Bl, Br], &[Sl, Sr], &[Fl, Fr], &[Fc]],
        Flc => &[&[Flc], &[Fl], &[Fc]],
        Frc => &[&[Frc], &[Fr], &[Fc]],
        Tfl => &[&[Tfl], &[Fl], &[Fc]],
        Tfr => &[&[Tfr], &[Fr], &[Fc]],
        Tfc => &[&[Tfc], &[Fc], &[Fl, Fr]],
        Tc => &[&[Tc], &[Fc], &[Fl, Fr]],
        Tbl => &[&[Tbl], &[Bl], &[Sl], &[Fl], &[Fc]],
        Tbr => &[&[Tbr], &[Br], &[Sr], &[Fr], &[Fc]],
        Tbc => &[&[Tbc], &[Bc], &[Bl, Br], &[Sl, Sr], &[Fl, Fr], &[Fc]],
        Unknown => &[],
    }
}

/// Mixing matrix between two channel layouts.
#[derive(Debug, Clone)]
pub struct Remapper {
    input_channels: usize,
    output_channels: usize,
    /// Per output channel: (input index, weight).
    rows: Vec<Vec<(usize, f32)>>,
}

impl Remapper {
    /// Build the matrix mapping `input` onto `output`.
    ///
    /// With `normalize` set, rows whose weights sum above 1.0 are scaled down
    /// so a full-scale downmix cannot clip.
    pub fn new(input: &Layout, output: &Layout, normalize: bool) -> Result<Self> {
        let remap_error = || Error::Remap {
            from: input.clone(),
            to: output.clone(),
        };

        if input.is_empty() || output.is_empty() {
            return Err(remap_error());
        }

        let mut rows = vec![Vec::new(); output.len()];
        let mut routed = 0;

        for (in_index, &channel) in input.channels().iter().enumerate() {
            let group = routes(channel)
                .iter()
                .find(|group| group.iter().all(|&c| output.contains(c)));

            let Some(group) = group else {
                trace!("Dropping {channel} when remapping {input} -> {output}");
                continue;
            };

            let weight = if group.len() > 1 { FRAC_1_SQRT_2 } else { 1.0 };
            for &target in *group {
                if let Some(out_index) = output.position(target) {
                    rows[out_index].push((in_index, weight));
                }
            }
            routed += 1;
        }

        if routed == 0 {
            return Err(remap_error());
        }

        if normalize {
            for row in &mut rows {
                let sum: f32 = row.iter().map(|(_, w)| w).sum();
                if sum > 1.0 {
                    row.iter_mut().for_each(|(_, w)| *w /= sum);
                }
            }
        }

        Ok(Self {
            input_channels: input.len(),
            output_channels: output.len(),
            rows,
        })
    }

    /// Fixed downmix of `input` to stereo, used for visualization.
    pub fn to_stereo(input: &Layout) -> Result<Self> {
        Self::new(input, &Layout::standard(StdLayout::Stereo), true)
    }

    pub const fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub const fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Weight applied to input channel `input` when producing `output`.
    pub fn weight(&self, output: usize, input: usize) -> f32 {
        self.rows
            .get(output)
            .and_then(|row| row.iter().find(|(i, _)| *i == input))
            .map_or(0.0, |(_, w)| *w)
    }

    /// Remap `frames` interleaved frames from `input` into `output`.
    ///
    /// Returns the number of frames written, bounded by both buffers.
    pub fn remap(&self, input: &[f32], output: &mut [f32], frames: usize) -> usize {
        let frames = frames
            .min(input.len() / self.input_channels)
            .min(output.len() / self.output_channels);

        let in_frames = input.chunks_exact(self.input_channels);
        let out_frames = output.chunks_exact_mut(self.output_channels);

        for (in_frame, out_frame) in in_frames.zip(out_frames).take(frames) {
            for (sample, row) in out_frame.iter_mut().zip(&self.rows) {
                *sample = row.iter().map(|&(i, w)| in_frame[i] * w).sum();
            }
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stereo() -> Layout {
        Layout::standard(StdLayout::Stereo)
    }

    #[test]
    fn test_stereo_identity() {
        let remap = Remapper::new(&stereo(), &stereo(), false).unwrap();
        let input = [0.1f32, -0.2, 0.3, -0.4];
        let mut output = [0.0f32; 4];
        assert_eq!(remap.remap(&input, &mut output, 2), 2);
        assert_eq!(output, input);
    }

    #[test]
    fn test_mono_to_stereo_splits() {
        let remap = Remapper::new(&Layout::standard(StdLayout::Mono), &stereo(), false).unwrap();
        assert!((remap.weight(0, 0) - FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((remap.weight(1, 0) - FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_to_mono() {
        let remap = Remapper::new(&stereo(), &Layout::standard(StdLayout::Mono), true).unwrap();
        let mut output = [0.0f32; 1];
        remap.remap(&[1.0, 1.0], &mut output, 1);
        assert!((output[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_surround_downmix_normalized() {
        let input = Layout::standard(StdLayout::Surround51);
        let remap = Remapper::new(&input, &stereo(), true).unwrap();

        // FL row takes FL, FC and BL; LFE is dropped.
        assert!(remap.weight(0, 0) > 0.0);
        assert!(remap.weight(0, 2) > 0.0);
        assert!(remap.weight(0, 4) > 0.0);
        assert!(remap.weight(0, 3).abs() < f32::EPSILON);

        let frame = [1.0f32; 6];
        let mut output = [0.0f32; 2];
        remap.remap(&frame, &mut output, 1);
        assert!(output.iter().all(|s| *s <= 1.0 + 1e-6));
    }

    #[test]
    fn test_upmix_leaves_missing_channels_silent() {
        let output = Layout::standard(StdLayout::Surround51);
        let remap = Remapper::new(&stereo(), &output, false).unwrap();
        let mut out = [9.0f32; 6];
        remap.remap(&[0.5, -0.5], &mut out, 1);
        assert_eq!(out, [0.5, -0.5, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_layouts_fail() {
        assert!(Remapper::new(&Layout::empty(), &stereo(), false).is_err());
        assert!(Remapper::new(&stereo(), &Layout::empty(), false).is_err());
    }

    #[test]
    fn test_unroutable_input_fails() {
        let input = Layout::new(vec![Channel::Lfe]);
        assert!(Remapper::new(&input, &stereo(), false).is_err());
    }

    #[test]
    fn test_remap_bounded_by_output() {
        let remap = Remapper::to_stereo(&stereo()).unwrap();
        let input = [0.5f32; 20];
        let mut output = [0.0f32; 4];
        assert_eq!(remap.remap(&input, &mut output, 10), 2);
    }

    proptest! {
        #[test]
        fn prop_remap_to_self_is_identity(
            count in 1usize..=8,
            samples in prop::collection::vec(-1.0f32..1.0, 0..256),
        ) {
            let layout = Layout::guess(count).unwrap();
            let remap = Remapper::new(&layout, &layout, true).unwrap();
            let frames = samples.len() / count;
            let input = &samples[..frames * count];
            let mut output = vec![0.0f32; input.len()];
            prop_assert_eq!(remap.remap(input, &mut output, frames), frames);
            prop_assert_eq!(&output[..], input);
        }
    }
}
