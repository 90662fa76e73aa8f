//! Shared domain types read by the core (§3 DATA MODEL) from the repository
//! façade. These are plain data; the repository owns their persistence.

use serde::{Deserialize, Serialize};

/// 1-based universe identifier, per §3.
pub type UniverseId = u16;
/// 1-based DMX channel within a universe, in `[1, 512]`.
pub type Channel = u16;

pub const DMX_UNIVERSE_SIZE: usize = 512;

/// What a fixture's channel is used for. Added per SPEC_FULL §10 so
/// `fade_to_black` has a concrete way to find intensity channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRole {
    Intensity,
    Color(ColorComponent),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorComponent {
    Red,
    Green,
    Blue,
    White,
    Amber,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub offset: u16, // 0-based offset from the fixture's start_channel
    pub role: ChannelRole,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub id: String,
    pub name: String,
    pub universe: UniverseId,
    pub start_channel: Channel,
    pub channels: Vec<ChannelDefinition>,
}

impl Fixture {
    /// Absolute DMX address for a channel offset, or `None` if it falls
    /// outside the valid `[1, 512]` range.
    pub fn address(&self, offset: u16) -> Option<Channel> {
        let addr = self.start_channel.checked_add(offset)?;
        if (1..=512).contains(&addr) {
            Some(addr)
        } else {
            None
        }
    }

    pub fn intensity_channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.channels.iter().filter_map(move |c| {
            if c.role == ChannelRole::Intensity {
                self.address(c.offset)
            } else {
                None
            }
        })
    }
}

/// A single fixture's channel values within a scene, additive-overlay
/// semantics per §9 Open Questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureValue {
    pub fixture_id: String,
    /// `channel_values[k]` is the value for the fixture's k-th declared
    /// channel (by offset order); a scene need not cover every channel.
    pub channel_values: Vec<Option<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub name: String,
    pub fixture_values: Vec<FixtureValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Easing {
    Linear,
    EaseInOutCubic,
    EaseInOutSine,
    EaseOutExponential,
    SCurve,
    Bezier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cue {
    pub id: String,
    pub scene_id: String,
    pub cue_number: f64,
    pub fade_in_ms: u64,
    pub fade_out_ms: u64,
    pub follow_ms: Option<u64>,
    pub easing: Option<Easing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CueList {
    pub id: String,
    pub name: String,
    pub loop_: bool,
    /// Ordered by `cue_number` ascending; the repository guarantees this.
    pub cues: Vec<Cue>,
}

impl CueList {
    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }
}
