//! Speaker positions and channel layouts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single speaker position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    /// Front left.
    Fl,
    /// Front right.
    Fr,
    /// Front center.
    Fc,
    /// Low frequency effects.
    Lfe,
    /// Back left.
    Bl,
    /// Back right.
    Br,
    /// Front left of center.
    Flc,
    /// Front right of center.
    Frc,
    /// Back center.
    Bc,
    /// Side left.
    Sl,
    /// Side right.
    Sr,
    /// Top front left.
    Tfl,
    /// Top front right.
    Tfr,
    /// Top front center.
    Tfc,
    /// Top center.
    Tc,
    /// Top back left.
    Tbl,
    /// Top back right.
    Tbr,
    /// Top back center.
    Tbc,
    /// Position the device did not report.
    Unknown,
}

impl Channel {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fl => "FL",
            Self::Fr => "FR",
            Self::Fc => "FC",
            Self::Lfe => "LFE",
            Self::Bl => "BL",
            Self::Br => "BR",
            Self::Flc => "FLOC",
            Self::Frc => "FROC",
            Self::Bc => "BC",
            Self::Sl => "SL",
            Self::Sr => "SR",
            Self::Tfl => "TFL",
            Self::Tfr => "TFR",
            Self::Tfc => "TFC",
            Self::Tc => "TC",
            Self::Tbl => "TBL",
            Self::Tbr => "TBR",
            Self::Tbc => "TBC",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Well-known speaker arrangements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdLayout {
    Mono,
    Stereo,
    Stereo21,
    Surround30,
    Quad,
    Surround50,
    Surround51,
    Surround70,
    Surround71,
}

impl StdLayout {
    pub const fn channels(self) -> &'static [Channel] {
        use Channel::{Bl, Br, Fc, Fl, Fr, Lfe, Sl, Sr};
        match self {
            Self::Mono => &[Fc],
            Self::Stereo => &[Fl, Fr],
            Self::Stereo21 => &[Fl, Fr, Lfe],
            Self::Surround30 => &[Fl, Fr, Fc],
            Self::Quad => &[Fl, Fr, Bl, Br],
            Self::Surround50 => &[Fl, Fr, Fc, Bl, Br],
            Self::Surround51 => &[Fl, Fr, Fc, Lfe, Bl, Br],
            Self::Surround70 => &[Fl, Fr, Fc, Bl, Br, Sl, Sr],
            Self::Surround71 => &[Fl, Fr, Fc, Lfe, Bl, Br, Sl, Sr],
        }
    }
}

/// Ordered list of speaker positions, one per interleaved sample in a frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Layout(Vec<Channel>);

impl Layout {
    /// An unspecified layout.
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new(channels: impl Into<Vec<Channel>>) -> Self {
        Self(channels.into())
    }

    pub fn standard(layout: StdLayout) -> Self {
        Self(layout.channels().to_vec())
    }

    /// Guess the conventional layout for a bare channel count.
    pub fn guess(channel_count: usize) -> Option<Self> {
        let layout = match channel_count {
            1 => StdLayout::Mono,
            2 => StdLayout::Stereo,
            3 => StdLayout::Surround30,
            4 => StdLayout::Quad,
            5 => StdLayout::Surround50,
            6 => StdLayout::Surround51,
            7 => StdLayout::Surround70,
            8 => StdLayout::Surround71,
            _ => return None,
        };
        Some(Self::standard(layout))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.0
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0.contains(&channel)
    }

    /// Index of a speaker within the interleaved frame.
    pub fn position(&self, channel: Channel) -> Option<usize> {
        self.0.iter().position(|&c| c == channel)
    }

    pub fn push(&mut self, channel: Channel) {
        self.0.push(channel);
    }
}

impl From<StdLayout> for Layout {
    fn from(layout: StdLayout) -> Self {
        Self::standard(layout)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(none)");
        }
        for (i, channel) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(channel.name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_layout() {
        assert_eq!(Layout::guess(1), Some(Layout::standard(StdLayout::Mono)));
        assert_eq!(Layout::guess(2).map(|l| l.len()), Some(2));
        assert_eq!(
            Layout::guess(6),
            Some(Layout::standard(StdLayout::Surround51))
        );
        assert_eq!(Layout::guess(0), None);
        assert_eq!(Layout::guess(9), None);
    }

    #[test]
    fn test_guessed_layouts_match_count() {
        for count in 1..=8 {
            let layout = Layout::guess(count);
            assert_eq!(layout.map(|l| l.len()), Some(count));
        }
    }

    #[test]
    fn test_layout_display() {
        let layout = Layout::standard(StdLayout::Stereo21);
        assert_eq!(layout.to_string(), "FL,FR,LFE");
        assert_eq!(Layout::empty().to_string(), "(none)");
    }

    #[test]
    fn test_position() {
        let layout = Layout::standard(StdLayout::Surround51);
        assert_eq!(layout.position(Channel::Lfe), Some(3));
        assert_eq!(layout.position(Channel::Sl), None);
        assert!(layout.contains(Channel::Fc));
    }
}
