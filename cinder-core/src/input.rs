//! Host buttons to playback commands.
//!
//! Commands fire on the press edge only; holding a button does nothing
//! after the first tick.

/// Buttons sampled once per tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    /// Shoulder L: next audio track
    pub l: bool,
    /// Shoulder R: next subtitle track
    pub r: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    SeekRelative { seconds: i64 },
    /// Back to the start
    Reset,
    CycleAudioTrack,
    CycleSubtitleTrack,
}

pub const SHORT_SEEK_SECS: i64 = 10;
pub const LONG_SEEK_SECS: i64 = 60;

/// Turns button edges into commands.
#[derive(Debug, Default)]
pub struct InputMapper {
    last: InputState,
    audio_tracks: usize,
    subtitle_tracks: usize,
}

impl InputMapper {
    pub fn new(audio_tracks: usize, subtitle_tracks: usize) -> Self {
        Self {
            last: InputState::default(),
            audio_tracks,
            subtitle_tracks,
        }
    }

    /// Track switches come before the seek; opposite seeks in one tick cancel.
    pub fn update(&mut self, input: InputState) -> Vec<PlaybackCommand> {
        let last = std::mem::replace(&mut self.last, input);
        let pressed = |now: bool, before: bool| now && !before;
        let mut commands = Vec::new();

        if pressed(input.l, last.l) && self.audio_tracks > 0 {
            commands.push(PlaybackCommand::CycleAudioTrack);
        } else if pressed(input.r, last.r) && self.subtitle_tracks > 0 {
            commands.push(PlaybackCommand::CycleSubtitleTrack);
        }

        let mut seconds = 0;
        if pressed(input.left, last.left) {
            seconds -= SHORT_SEEK_SECS;
        }
        if pressed(input.right, last.right) {
            seconds += SHORT_SEEK_SECS;
        }
        if pressed(input.up, last.up) {
            seconds += LONG_SEEK_SECS;
        }
        if pressed(input.down, last.down) {
            seconds -= LONG_SEEK_SECS;
        }
        if seconds != 0 {
            commands.push(PlaybackCommand::SeekRelative { seconds });
        }

        commands
    }
}
