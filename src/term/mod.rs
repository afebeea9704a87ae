//! One terminal per VT: a PTY pair and child shell, a screen grid fed by
//! the VT parser, and cell rendering into the shared scanout surface.

pub mod screen;

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::rc::Rc;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{Winsize, openpty};
use tracing::{debug, warn};

use crate::font;
use crate::image::{self, ImageData, Placement};
use crate::keys::{self, Keysym, Modifiers};
use crate::surface::Surface;
use crate::term::screen::{GfxCommand, Screen};
use crate::{CinderError, Result};

pub struct Terminal {
    vt: usize,
    active: bool,
    surface: Rc<RefCell<Surface>>,
    screen: Screen,
    parser: vte::Parser,
    pty: Option<Pty>,
    last_age: u64,
    gfx_enabled: bool,
}

struct Pty {
    master: OwnedFd,
    slave_path: PathBuf,
    child: Child,
    child_done: bool,
}

impl Terminal {
    /// Create the terminal for `vt`. The splash terminal (VT 0) and
    /// `--no-login` consoles run without a child shell.
    pub fn new(
        vt: usize,
        surface: Rc<RefCell<Surface>>,
        spawn_shell: bool,
        gfx_enabled: bool,
    ) -> Result<Terminal> {
        let (cols, rows) = grid_size(&surface.borrow());
        let screen = Screen::new(cols, rows);

        let pty = if spawn_shell {
            Some(Pty::spawn(vt, cols as u16, rows as u16)?)
        } else {
            None
        };

        Ok(Terminal {
            vt,
            active: false,
            surface,
            screen,
            parser: vte::Parser::new(),
            pty,
            last_age: 0,
            gfx_enabled,
        })
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn master_fd(&self) -> Option<BorrowedFd<'_>> {
        self.pty.as_ref().map(|pty| pty.master.as_fd())
    }

    pub fn ptsname(&self) -> Option<&Path> {
        self.pty.as_ref().map(|pty| pty.slave_path.as_path())
    }

    /// Whether the child shell has exited. Polled from the event loop;
    /// `waitpid` with `WNOHANG` underneath, so this never blocks.
    pub fn child_done(&mut self) -> bool {
        let Some(pty) = &mut self.pty else {
            return false;
        };
        if pty.child_done {
            return true;
        }
        match pty.child.try_wait() {
            Ok(Some(status)) => {
                debug!(vt = self.vt, %status, "shell exited");
                pty.child_done = true;
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(vt = self.vt, "waitpid: {err}");
                pty.child_done = true;
                true
            }
        }
    }

    /// Drain the PTY master and feed the parser. Returns false when the
    /// other end is gone.
    pub fn process_output(&mut self) -> bool {
        let Some(pty) = &self.pty else {
            return true;
        };

        let mut buf = [0u8; 4096];
        let mut alive = true;
        loop {
            match nix::unistd::read(&pty.master, &mut buf) {
                Ok(0) => {
                    alive = false;
                    break;
                }
                Ok(n) => self.parser.advance(&mut self.screen, &buf[..n]),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    // EIO is the normal "no process on the slave" signal.
                    if err != Errno::EIO {
                        warn!(vt = self.vt, "pty read: {err}");
                    }
                    alive = false;
                    break;
                }
            }
        }

        if self.gfx_enabled {
            self.apply_gfx();
        }
        if let Err(err) = self.redraw() {
            warn!(vt = self.vt, "redraw: {err}");
        }
        alive
    }

    /// Deliver one key press: encode it, write to the PTY, snap the view
    /// back to the live screen.
    pub fn key_event(&mut self, keysym: Keysym, mods: Modifiers) {
        let mut bytes = Vec::new();
        keys::encode(keysym, mods, &mut bytes);
        if bytes.is_empty() {
            return;
        }

        self.screen.sb_reset();
        if let Some(pty) = &self.pty {
            let mut rest = bytes.as_slice();
            while !rest.is_empty() {
                match nix::unistd::write(&pty.master, rest) {
                    Ok(n) => rest = &rest[n..],
                    Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                    Err(err) => {
                        warn!(vt = self.vt, "pty write: {err}");
                        break;
                    }
                }
            }
        }
        if let Err(err) = self.redraw() {
            warn!(vt = self.vt, "redraw: {err}");
        }
    }

    // Scrollback hotkeys.

    pub fn scroll_line_up(&mut self) {
        self.screen.sb_line_up();
        let _ = self.redraw();
    }

    pub fn scroll_line_down(&mut self) {
        self.screen.sb_line_down();
        let _ = self.redraw();
    }

    pub fn scroll_page_up(&mut self) {
        self.screen.sb_page_up();
        let _ = self.redraw();
    }

    pub fn scroll_page_down(&mut self) {
        self.screen.sb_page_down();
        let _ = self.redraw();
    }

    /// Repaint cells aged since the last draw. Inverse cells swap fg/bg;
    /// empty cells are cleared.
    pub fn redraw(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        let mut surface = self.surface.borrow_mut();
        let (pitch, scaling) = (surface.pitch(), surface.scaling());
        let mut frame = surface.lock()?;
        let pixels = frame.pixels();

        self.last_age = self.screen.draw(self.last_age, |col, row, ch, attrs| {
            let (mut fg, mut bg) = (attrs.fg, attrs.bg);
            if attrs.inverse {
                std::mem::swap(&mut fg, &mut bg);
            }
            match ch {
                Some(ch) => {
                    font::render_cell(pixels, col, row, pitch, scaling, ch as u32, fg, bg)
                }
                None => font::fill_cell(pixels, col, row, pitch, scaling, bg),
            }
        });
        Ok(())
    }

    /// Full repaint; used right after a mode-set.
    pub fn redraw_all(&mut self) -> Result<()> {
        self.last_age = 0;
        self.redraw()
    }

    /// Re-derive the grid from the (possibly replaced) surface and tell
    /// both the screen and the child about the new size.
    pub fn resize_to_surface(&mut self) {
        let (cols, rows) = grid_size(&self.surface.borrow());
        self.screen.resize(cols, rows);
        self.last_age = 0;
        if let Some(pty) = &self.pty {
            set_winsize(pty.master.as_fd(), cols as u16, rows as u16);
        }
    }

    pub fn set_surface(&mut self, surface: Rc<RefCell<Surface>>) {
        self.surface = surface;
        self.resize_to_surface();
    }

    // Surface API used by the splash player and the Image command.

    pub fn dimensions(&self) -> (u32, u32) {
        let surface = self.surface.borrow();
        (surface.width(), surface.height())
    }

    pub fn set_background(&mut self, color: u32) {
        self.screen.set_default_colors(screen::DEFAULT_FG, color);
    }

    pub fn clear(&mut self) {
        self.screen.clear();
        let _ = self.redraw();
    }

    /// Blit an image and flush, independent of the cell grid.
    pub fn show_image(
        &mut self,
        data: &ImageData,
        placement: Placement,
        scale: u32,
    ) -> Result<()> {
        let mut surface = self.surface.borrow_mut();
        let (width, height, pitch) = (surface.width(), surface.height(), surface.pitch());
        let (x, y) = image::placement_origin(
            placement,
            (width, height),
            (data.width() * scale, data.height() * scale),
        );
        let mut frame = surface.lock()?;
        image::blit(data, scale, frame.pixels(), pitch, width, height, x, y);
        Ok(())
    }

    /// Error reporting surface while the splash owns the display.
    pub fn write_message(&mut self, message: &str) {
        let mut bytes = Vec::with_capacity(message.len() + 4);
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(message.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.parser.advance(&mut self.screen, &bytes);
        let _ = self.redraw();
    }

    fn apply_gfx(&mut self) {
        for command in self.screen.take_gfx() {
            match command {
                GfxCommand::Image {
                    path,
                    placement,
                    scale,
                } => match image::load(Path::new(&path)) {
                    Ok(data) => {
                        if let Err(err) = self.show_image(&data, placement, scale) {
                            warn!(vt = self.vt, "image escape: {err}");
                        }
                    }
                    Err(err) => self.write_message(&err.to_string()),
                },
                GfxCommand::Box {
                    color,
                    size,
                    placement,
                } => {
                    let data = ImageData::from_pixels(
                        size.0,
                        size.1,
                        vec![color; (size.0 * size.1) as usize],
                    );
                    if let Err(err) = self.show_image(&data, placement, 1) {
                        warn!(vt = self.vt, "box escape: {err}");
                    }
                }
            }
        }
    }
}

impl Pty {
    fn spawn(vt: usize, cols: u16, rows: u16) -> Result<Pty> {
        let terminal_error = |err: io::Error| CinderError::Terminal { vt, source: err };

        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None).map_err(|err| terminal_error(err.into()))?;
        let slave_path =
            nix::unistd::ttyname(pty.slave.as_fd()).map_err(|err| terminal_error(err.into()))?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_owned());
        let mut cmd = Command::new(&shell);
        cmd.arg("-il").env("TERM", "xterm");

        let slave = pty.slave;
        let controlling = slave.try_clone().map_err(terminal_error)?;
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid()?;
                if libc::ioctl(controlling.as_raw_fd(), libc::TIOCSCTTY, 1) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
            cmd.stdin(Stdio::from(slave.try_clone().map_err(terminal_error)?));
            cmd.stdout(Stdio::from(slave.try_clone().map_err(terminal_error)?));
            cmd.stderr(Stdio::from(slave));
        }

        let child = cmd.spawn().map_err(terminal_error)?;
        debug!(vt, shell = %shell, pid = child.id(), slave = %slave_path.display(), "shell spawned");

        fcntl(&pty.master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|err| terminal_error(err.into()))?;

        Ok(Pty {
            master: pty.master,
            slave_path,
            child,
            child_done: false,
        })
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        if !self.child_done {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

fn grid_size(surface: &Surface) -> (usize, usize) {
    let (cell_w, cell_h) = font::cell_size(surface.scaling());
    let cols = (surface.width() / cell_w).max(1) as usize;
    let rows = (surface.height() / cell_h).max(1) as usize;
    (cols, rows)
}

fn set_winsize(fd: BorrowedFd<'_>, cols: u16, rows: u16) {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) } < 0 {
        warn!("TIOCSWINSZ: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headless_terminal() -> Terminal {
        let surface = Rc::new(RefCell::new(Surface::headless(0)));
        Terminal::new(0, surface, false, false).unwrap()
    }

    #[test]
    fn grid_matches_headless_surface() {
        let term = headless_terminal();
        // 640x480 at scaling 1 with 8x16 glyphs.
        assert_eq!(term.screen.cols(), 80);
        assert_eq!(term.screen.rows(), 30);
    }

    #[test]
    fn shell_less_terminal_has_no_pty() {
        let mut term = headless_terminal();
        assert!(term.ptsname().is_none());
        assert!(term.master_fd().is_none());
        assert!(!term.child_done());
        assert!(term.process_output());
    }

    #[test]
    fn inactive_terminal_skips_rendering() {
        let mut term = headless_terminal();
        term.write_message("hello");
        assert_eq!(term.last_age, 0);
    }

    #[test]
    fn active_terminal_paints_message() {
        let mut term = headless_terminal();
        term.set_active(true);
        term.set_background(0x00112233);
        term.clear();
        term.write_message("hi");
        assert!(term.last_age > 0);

        let surface = term.surface.clone();
        let mut surface = surface.borrow_mut();
        let mut frame = surface.lock().unwrap();
        assert!(frame.pixels().iter().any(|&px| px == 0x00112233));
    }

    #[test]
    fn show_image_lands_at_location() {
        let mut term = headless_terminal();
        let data = ImageData::from_pixels(1, 1, vec![0x00ABCDEF]);
        term.show_image(&data, Placement::Location(3, 2), 1).unwrap();

        let surface = term.surface.clone();
        let mut surface = surface.borrow_mut();
        let mut frame = surface.lock().unwrap();
        let stride = frame.pitch() as usize / 4;
        assert_eq!(frame.pixels()[2 * stride + 3], 0x00ABCDEF);
    }
}
