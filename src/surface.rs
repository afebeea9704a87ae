//! The scanout surface: a CPU-mapped dumb buffer on the console card, or a
//! plain memory buffer when no display is usable.
//!
//! Drawing goes through [`Surface::lock`], which hands out a [`Frame`]
//! guard. Dropping the guard flushes the damage to the display, so pixel
//! access outside a lock cannot be expressed.

use std::rc::Rc;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::{DumbBuffer, DumbMapping};
use drm::control::{ClipRect, Device as ControlDevice, framebuffer};
use tracing::debug;

use crate::drm::Card;
use crate::{CinderError, Result};

pub const HEADLESS_WIDTH: u32 = 640;
pub const HEADLESS_HEIGHT: u32 = 480;

pub struct Surface {
    kind: Kind,
    width: u32,
    height: u32,
    pitch: u32,
    scaling: u32,
}

enum Kind {
    Drm {
        card: Rc<Card>,
        buffer: DumbBuffer,
        fb: framebuffer::Handle,
    },
    Headless {
        pixels: Vec<u32>,
    },
}

impl Surface {
    /// Allocate a framebuffer sized to the card's console mode.
    pub fn new(card: Rc<Card>, forced_scale: u32) -> Result<Surface> {
        let (width, height) = card.mode().size();
        let (width, height) = (width as u32, height as u32);

        let buffer = card
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, 32)
            .map_err(|err| CinderError::Surface(format!("create dumb buffer: {err}")))?;
        let pitch = buffer.pitch();
        let fb = match card.add_framebuffer(&buffer, 24, 32) {
            Ok(fb) => fb,
            Err(err) => {
                let _ = card.destroy_dumb_buffer(buffer);
                return Err(CinderError::Surface(format!("add framebuffer: {err}")));
            }
        };

        let scaling = if forced_scale != 0 {
            forced_scale
        } else {
            scaling_for(width, card.physical_size().0)
        };
        debug!(width, height, pitch, scaling, "surface created");

        Ok(Surface {
            kind: Kind::Drm { card, buffer, fb },
            width,
            height,
            pitch,
            scaling,
        })
    }

    /// No-monitor fallback: mode-sets become no-ops, drawing still works.
    pub fn headless(forced_scale: u32) -> Surface {
        Surface {
            kind: Kind::Headless {
                pixels: vec![0; (HEADLESS_WIDTH * HEADLESS_HEIGHT) as usize],
            },
            width: HEADLESS_WIDTH,
            height: HEADLESS_HEIGHT,
            pitch: HEADLESS_WIDTH * 4,
            scaling: if forced_scale != 0 { forced_scale } else { 1 },
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn scaling(&self) -> u32 {
        self.scaling
    }

    pub fn set_scaling(&mut self, scaling: u32) {
        self.scaling = scaling.clamp(1, 4);
    }

    /// Point the console CRTC at this surface.
    pub fn set_mode(&self) -> Result<()> {
        match &self.kind {
            Kind::Drm { card, fb, .. } => card.set_mode(*fb),
            Kind::Headless { .. } => Ok(()),
        }
    }

    /// Map the buffer for drawing. The returned frame flushes on drop.
    pub fn lock(&mut self) -> Result<Frame<'_>> {
        let (width, height, pitch) = (self.width, self.height, self.pitch);
        match &mut self.kind {
            Kind::Drm { card, buffer, fb } => {
                let fb = *fb;
                let card: &Card = card;
                let mapping = card
                    .map_dumb_buffer(buffer)
                    .map_err(|err| CinderError::Surface(format!("map dumb buffer: {err}")))?;
                Ok(Frame {
                    pixels: FramePixels::Mapped(mapping),
                    flush: Some((card, fb)),
                    width,
                    height,
                    pitch,
                })
            }
            Kind::Headless { pixels } => Ok(Frame {
                pixels: FramePixels::Plain(pixels),
                flush: None,
                width,
                height,
                pitch,
            }),
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        let kind = std::mem::replace(
            &mut self.kind,
            Kind::Headless { pixels: Vec::new() },
        );
        if let Kind::Drm { card, buffer, fb } = kind {
            // Keep the framebuffer alive until the next mode-set so the
            // handoff never flashes black.
            card.schedule_rmfb(fb);
            let _ = card.destroy_dumb_buffer(buffer);
        }
    }
}

/// A locked surface. Pixels are XRGB8888, `pitch` bytes per row.
pub struct Frame<'a> {
    pixels: FramePixels<'a>,
    flush: Option<(&'a Card, framebuffer::Handle)>,
    width: u32,
    height: u32,
    pitch: u32,
}

enum FramePixels<'a> {
    Mapped(DumbMapping<'a>),
    Plain(&'a mut [u32]),
}

impl Frame<'_> {
    pub fn pixels(&mut self) -> &mut [u32] {
        match &mut self.pixels {
            FramePixels::Mapped(mapping) => bytemuck::cast_slice_mut(mapping.as_mut()),
            FramePixels::Plain(pixels) => pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Fill the whole frame with one color.
    pub fn clear(&mut self, color: u32) {
        let (width, height, pitch) = (self.width, self.height, self.pitch);
        let stride = pitch as usize / 4;
        let pixels = self.pixels();
        for row in 0..height as usize {
            for px in &mut pixels[row * stride..row * stride + width as usize] {
                *px = color;
            }
        }
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        if let Some((card, fb)) = self.flush {
            let clip = ClipRect::new(0, 0, self.width as u16, self.height as u16);
            if let Err(err) = card.dirty_framebuffer(fb, &[clip]) {
                debug!("dirty framebuffer: {err}");
            }
        }
    }
}

/// Integer display scaling from panel DPI. Piecewise constant in
/// dots-per-centimetre with breakpoints at 67, 100 and 133; an unknown
/// physical width means no scaling.
pub fn scaling_for(width: u32, mm_width: u32) -> u32 {
    if mm_width == 0 {
        return 1;
    }
    let dots_per_cm = width * 10 / mm_width;
    if dots_per_cm > 133 {
        4
    } else if dots_per_cm > 100 {
        3
    } else if dots_per_cm > 67 {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_breakpoints() {
        // width=mm*dpc/10 -> pick widths giving exact dots-per-cm values.
        let mm = 100;
        for (dots_per_cm, expect) in [
            (10, 1),
            (67, 1),
            (68, 2),
            (100, 2),
            (101, 3),
            (133, 3),
            (134, 4),
            (500, 4),
        ] {
            assert_eq!(
                scaling_for(dots_per_cm * mm / 10, mm),
                expect,
                "at {dots_per_cm} dots/cm"
            );
        }
    }

    #[test]
    fn scaling_monotone() {
        let mm = 200;
        let mut last = 0;
        for dots_per_cm in 1..300 {
            let s = scaling_for(dots_per_cm * mm / 10, mm);
            assert!(s >= last);
            last = s;
        }
    }

    #[test]
    fn unknown_panel_width_means_no_scaling() {
        assert_eq!(scaling_for(3840, 0), 1);
    }

    #[test]
    fn headless_defaults() {
        let surface = Surface::headless(0);
        assert_eq!(surface.width(), 640);
        assert_eq!(surface.height(), 480);
        assert_eq!(surface.pitch(), 2560);
        assert_eq!(surface.scaling(), 1);
        assert!(surface.set_mode().is_ok());
    }

    #[test]
    fn headless_frame_round_trip() {
        let mut surface = Surface::headless(0);
        {
            let mut frame = surface.lock().unwrap();
            frame.clear(0x00AA55AA);
            frame.pixels()[0] = 0x11223344;
        }
        let mut frame = surface.lock().unwrap();
        assert_eq!(frame.pixels()[0], 0x11223344);
        assert_eq!(frame.pixels()[1], 0x00AA55AA);
    }
}
