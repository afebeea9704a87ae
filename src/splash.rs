//! The boot-splash player: timed PNG frames with an optional looping tail
//! segment, rendered through the splash terminal. Pacing runs on the
//! monotonic clock; the event loop is pumped between frames so commands
//! and input keep flowing.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use calloop::EventLoop;
use tracing::{debug, warn};

use crate::config::Config;
use crate::image::{self, ImageData, Placement};
use crate::state::{Cinder, SPLASH_VT};
use crate::{CinderError, Result};

/// Give up on logging (not on playing) after this many failures.
const MAX_FAILURES: u32 = 30;

const PUMP_CAP: Duration = Duration::from_micros(1);

pub struct SplashFrame {
    path: PathBuf,
    data: Option<ImageData>,
    duration_ms: u64,
    offset: (i32, i32),
}

pub struct Splash {
    frames: Vec<SplashFrame>,
    clear_color: u32,
    loop_start: i32,
    loop_count: i32,
    loop_duration_ms: u64,
    loop_offset: (i32, i32),
    scale: u32,
}

impl Splash {
    /// Build the frame program from the command line. High-DPI panels use
    /// the `--image-hires` set when one was given.
    pub fn from_config(config: &Config, scaling: u32) -> Splash {
        let hires = scaling > 1 && !config.images_hires.is_empty();
        let named = if hires {
            &config.images_hires
        } else {
            &config.images
        };

        let mut frames = Vec::new();
        for spec in named.iter().chain(&config.splash_frames) {
            frames.push(parse_filespec(
                spec,
                config.frame_interval_ms,
                config.offset,
            ));
        }

        Splash {
            frames,
            clear_color: config.clear_color,
            loop_start: config.loop_start,
            loop_count: config.loop_count,
            loop_duration_ms: config.loop_interval_ms,
            loop_offset: config.loop_offset,
            // Low-DPI art is pixel-doubled up to the display scaling.
            scale: if hires { 1 } else { scaling },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Duration and offset for one frame; frames inside the loop segment
    /// use the loop parameters instead of their own.
    fn frame_params(&self, index: usize) -> (u64, (i32, i32)) {
        if self.loop_start >= 0 && index >= self.loop_start as usize {
            (self.loop_duration_ms, self.loop_offset)
        } else {
            let frame = &self.frames[index];
            (frame.duration_ms, frame.offset)
        }
    }

    /// Play the program. The mode-set happens on the first successful
    /// show, so the panel never lights up with a half-drawn frame.
    pub fn run(
        mut self,
        state: &mut Cinder,
        event_loop: &mut EventLoop<'static, Cinder>,
    ) -> Result<()> {
        if self.frames.is_empty() {
            return Ok(());
        }

        {
            let clear_color = self.clear_color;
            let terminal = state.ensure_terminal(SPLASH_VT)?;
            terminal.set_active(true);
            terminal.set_background(clear_color);
            terminal.clear();
        }

        let mut shown = false;
        let mut failures = 0u32;
        let mut last_show: Option<Instant> = None;

        for index in frame_sequence(self.frames.len(), self.loop_start, self.loop_count) {
            if state.terminating() || state.splash_destroyed() {
                break;
            }

            let (duration_ms, offset) = self.frame_params(index);

            if self.frames[index].data.is_none() {
                match image::load(&self.frames[index].path) {
                    Ok(data) => self.frames[index].data = Some(data),
                    Err(err) => {
                        failures += 1;
                        if failures <= MAX_FAILURES {
                            warn!("{err}");
                        }
                        continue;
                    }
                }
            }

            if let Some(at) = last_show {
                let elapsed = at.elapsed();
                let pause = Duration::from_millis(duration_ms).saturating_sub(elapsed);
                if !pause.is_zero() {
                    std::thread::sleep(pause);
                }
            }
            last_show = Some(Instant::now());

            let (fb_w, fb_h) = state.display_resolution();
            let scale = self.scale;
            let data = self.frames[index].data.as_ref().unwrap();
            let x = (fb_w as i32 - (data.width() * scale) as i32 + offset.0) / 2;
            let y = (fb_h as i32 - (data.height() * scale) as i32 + offset.1) / 2;

            let terminal = state.ensure_terminal(SPLASH_VT)?;
            match terminal.show_image(data, Placement::Location(x, y), scale) {
                Ok(()) => {
                    if !shown {
                        shown = true;
                        state.splash_take_display();
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures <= MAX_FAILURES {
                        warn!("show frame {index}: {err}");
                    }
                }
            }

            event_loop
                .dispatch(Some(PUMP_CAP), state)
                .map_err(|err| CinderError::EventLoop(err.to_string()))?;
        }

        debug!("splash sequence finished");
        Ok(())
    }
}

/// `path[:duration_ms[:x,y]]`, with program-wide defaults for the omitted
/// parts.
fn parse_filespec(spec: &str, default_duration: u64, default_offset: (i32, i32)) -> SplashFrame {
    let mut parts = spec.splitn(3, ':');
    let path = PathBuf::from(parts.next().unwrap_or_default());
    let duration_ms = parts
        .next()
        .and_then(|d| d.parse().ok())
        .unwrap_or(default_duration);
    let offset = parts
        .next()
        .and_then(|pair| crate::config::parse_pair(pair).ok())
        .unwrap_or(default_offset);

    SplashFrame {
        path,
        data: None,
        duration_ms,
        offset,
    }
}

/// The order frames are shown in: one linear pass, then the loop segment
/// `[loop_start, frames)` repeated `loop_count` more times (forever when
/// negative).
pub fn frame_sequence(frames: usize, loop_start: i32, loop_count: i32) -> FrameSequence {
    let loop_start = if (0..frames as i32).contains(&loop_start) {
        Some(loop_start as usize)
    } else {
        None
    };
    FrameSequence {
        frames,
        next: 0,
        loop_start,
        remaining_loops: loop_count,
    }
}

pub struct FrameSequence {
    frames: usize,
    next: usize,
    loop_start: Option<usize>,
    remaining_loops: i32,
}

impl Iterator for FrameSequence {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next >= self.frames {
            let start = self.loop_start?;
            if self.remaining_loops == 0 {
                return None;
            }
            if self.remaining_loops > 0 {
                self.remaining_loops -= 1;
            }
            self.next = start;
        }
        let index = self.next;
        self.next += 1;
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_sequence_without_loop() {
        let order: Vec<usize> = frame_sequence(3, -1, -1).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn loop_segment_repeats_counted_times() {
        let order: Vec<usize> = frame_sequence(4, 2, 2).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 2, 3, 2, 3]);
    }

    #[test]
    fn negative_count_loops_forever() {
        let order: Vec<usize> = frame_sequence(3, 1, -1).take(9).collect();
        assert_eq!(order, vec![0, 1, 2, 1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn out_of_range_loop_start_plays_once() {
        let order: Vec<usize> = frame_sequence(3, 7, -1).collect();
        assert_eq!(order, vec![0, 1, 2]);
        let order: Vec<usize> = frame_sequence(3, -1, 5).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn filespec_defaults_and_overrides() {
        let frame = parse_filespec("boot.png", 25, (3, 4));
        assert_eq!(frame.path, PathBuf::from("boot.png"));
        assert_eq!(frame.duration_ms, 25);
        assert_eq!(frame.offset, (3, 4));

        let frame = parse_filespec("boot.png:40:-2,9", 25, (0, 0));
        assert_eq!(frame.duration_ms, 40);
        assert_eq!(frame.offset, (-2, 9));
    }

    #[test]
    fn loop_frames_use_loop_parameters() {
        let config = Config {
            frame_interval_ms: 25,
            loop_start: 1,
            loop_interval_ms: 60,
            loop_offset: (7, 8),
            splash_frames: vec!["a.png".into(), "b.png".into(), "c.png".into()],
            ..Config::default()
        };
        let splash = Splash::from_config(&config, 1);
        assert_eq!(splash.frame_params(0), (25, (0, 0)));
        assert_eq!(splash.frame_params(1), (60, (7, 8)));
        assert_eq!(splash.frame_params(2), (60, (7, 8)));
    }

    #[test]
    fn hires_frames_selected_for_scaled_panels() {
        let config = Config {
            images: vec!["lo.png".into()],
            images_hires: vec!["hi.png".into()],
            ..Config::default()
        };
        let lodpi = Splash::from_config(&config, 1);
        assert_eq!(lodpi.frames[0].path, PathBuf::from("lo.png"));
        assert_eq!(lodpi.scale, 1);

        let hidpi = Splash::from_config(&config, 2);
        assert_eq!(hidpi.frames[0].path, PathBuf::from("hi.png"));
        assert_eq!(hidpi.scale, 1);

        let no_hires = Splash::from_config(
            &Config {
                images: vec!["lo.png".into()],
                ..Config::default()
            },
            2,
        );
        assert_eq!(no_hires.scale, 2);
    }
}
