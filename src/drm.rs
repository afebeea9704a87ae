//! KMS device management: scanning and scoring card nodes, console
//! connector/CRTC/mode selection, legacy mode-sets, the master lease, and
//! EDID-derived panel geometry.

use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use drm::ClientCapability;
use drm::Device;
use drm::control::{
    Device as ControlDevice, Mode, ModeTypeFlags, PlaneType, ResourceHandles, connector, crtc,
    framebuffer, plane,
};
use tracing::{debug, info, warn};

use crate::{CinderError, Result};

const MAX_CARD_MINORS: u32 = 16;
const MASTER_RETRIES: u32 = 10;
const MASTER_RETRY_DELAY: Duration = Duration::from_millis(100);
const EDID_SIZE: usize = 128;

// Priority order for the console monitor; all three are internal panels.
const INTERNAL_INTERFACES: [connector::Interface; 3] = [
    connector::Interface::LVDS,
    connector::Interface::EmbeddedDisplayPort,
    connector::Interface::DSI,
];

/// One opened KMS node, selected as the console display. Shared with
/// surfaces and terminals via `Rc`.
pub struct Card {
    file: File,
    path: PathBuf,
    driver: String,
    resources: ResourceHandles,
    console_connector: connector::Handle,
    console_internal: bool,
    console_crtc: Cell<crtc::Handle>,
    console_mode: Mode,
    mm_size: (u32, u32),
    edid: RefCell<Option<Vec<u8>>>,
    delayed_rmfb: Cell<Option<framebuffer::Handle>>,
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

// The open node before console selection has succeeded.
struct Probe {
    file: File,
}

impl AsFd for Probe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Device for Probe {}
impl ControlDevice for Probe {}

impl Card {
    /// Open and qualify one card node. The returned card holds master.
    fn probe(path: &Path, lid_closed: bool) -> Result<Card> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(CinderError::Drm)?;
        let probe = Probe { file };

        // The graphical session may still hold master; back off briefly.
        let mut attempt = 0;
        loop {
            match probe.acquire_master_lock() {
                Ok(()) => break,
                Err(err) if attempt < MASTER_RETRIES => {
                    debug!("master contention on {}: {err}", path.display());
                    attempt += 1;
                    thread::sleep(MASTER_RETRY_DELAY);
                }
                Err(err) => return Err(CinderError::Drm(err)),
            }
        }

        let resources = probe.resource_handles().map_err(CinderError::Drm)?;

        // A node without CRTCs or connectors cannot display anything (vgem).
        if resources.crtcs().is_empty() || resources.connectors().is_empty() {
            return Err(CinderError::NoDisplay);
        }

        let _ = probe.set_client_capability(ClientCapability::UniversalPlanes, true);

        let (conn, crtc) = find_main_monitor(&probe, &resources, lid_closed)?;
        let mode = *conn
            .modes()
            .iter()
            .find(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED))
            .unwrap_or(&conn.modes()[0]);

        let driver = probe
            .get_driver()
            .map(|d| d.name().to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Card {
            file: probe.file,
            path: path.to_owned(),
            driver,
            console_connector: conn.handle(),
            console_internal: is_internal(conn.interface()),
            console_crtc: Cell::new(crtc),
            console_mode: mode,
            mm_size: conn.size().unwrap_or((0, 0)),
            edid: RefCell::new(None),
            delayed_rmfb: Cell::new(None),
            resources,
        })
    }

    pub fn mode(&self) -> Mode {
        self.console_mode
    }

    pub fn acquire_master(&self) -> Result<()> {
        self.acquire_master_lock().map_err(CinderError::Drm)
    }

    pub fn drop_master(&self) {
        if let Err(err) = self.release_master_lock() {
            debug!("drop master: {err}");
        }
    }

    /// Program the console CRTC and quiesce everything else on the card.
    pub fn set_mode(&self, fb: framebuffer::Handle) -> Result<()> {
        let existing = connector_crtc_path(self, self.console_connector);

        for &conn in self.resources.connectors() {
            if conn == self.console_connector {
                // The preferred CRTC may have moved since detection.
                let crtc = match existing {
                    Some(crtc) => crtc,
                    None => crtc_with_most_planes(self, &self.resources, conn)
                        .ok_or(CinderError::NoDisplay)?,
                };
                self.console_crtc.set(crtc);

                self.set_crtc(crtc, Some(fb), (0, 0), &[conn], Some(self.console_mode))
                    .map_err(CinderError::Drm)?;
                self.disable_other_planes(crtc);
            } else if let Some(crtc) = connector_crtc_path(self, conn) {
                // Mirrors of the console CRTC go dark with the mode-set
                // itself; disabling the shared CRTC would kill the console.
                if existing == Some(crtc) {
                    continue;
                }
                if let Err(err) = self.set_crtc(crtc, None, (0, 0), &[], None) {
                    warn!("unable to disable crtc {crtc:?}: {err}");
                }
            }
        }

        self.clear_rmfb();
        Ok(())
    }

    /// Disable every plane except the console CRTC's primary. With
    /// universal planes exposed this also removes the hardware cursor.
    fn disable_other_planes(&self, console_crtc: crtc::Handle) {
        let Ok(planes) = self.plane_handles() else {
            return;
        };
        for &handle in planes.iter() {
            let Ok(info) = self.get_plane(handle) else {
                continue;
            };
            let Some(crtc) = info.crtc() else {
                continue;
            };
            if crtc == console_crtc && self.is_primary_plane(handle) {
                continue;
            }
            if let Err(err) = self.set_plane(handle, crtc, None, 0, (0, 0, 0, 0), (0, 0, 0, 0)) {
                warn!("unable to disable plane {handle:?}: {err}");
            }
        }
    }

    fn is_primary_plane(&self, handle: plane::Handle) -> bool {
        let Ok(props) = self.get_properties(handle) else {
            return false;
        };
        for (&id, &value) in props.iter() {
            if let Ok(info) = self.get_property(id)
                && info.name().to_str() == Ok("type")
            {
                return value == u64::from(PlaneType::Primary as u32);
            }
        }
        false
    }

    /// Delayed framebuffer removal: the previous scanout buffer stays alive
    /// until the next mode-set so transitions never show a black frame.
    pub fn schedule_rmfb(&self, fb: framebuffer::Handle) {
        self.clear_rmfb();
        self.delayed_rmfb.set(Some(fb));
    }

    fn clear_rmfb(&self) {
        if let Some(fb) = self.delayed_rmfb.take() {
            let _ = self.destroy_framebuffer(fb);
        }
    }

    /// The console connector's EDID blob, read once and cached.
    pub fn edid(&self) -> Option<Vec<u8>> {
        if let Some(edid) = self.edid.borrow().as_ref() {
            return Some(edid.clone());
        }

        let props = self.get_properties(self.console_connector).ok()?;
        for (&id, &value) in props.iter() {
            let Ok(info) = self.get_property(id) else {
                continue;
            };
            if info.name().to_str() != Ok("EDID") {
                continue;
            }
            let blob = info.value_type().convert_value(value).as_blob()?;
            let data = self.get_property_blob(blob).ok()?;
            if data.len() < EDID_SIZE {
                return None;
            }
            let data = data[..EDID_SIZE].to_vec();
            *self.edid.borrow_mut() = Some(data.clone());
            return Some(data);
        }
        None
    }

    /// Physical panel size in millimetres: the connector's own report, or
    /// the EDID detailed timing matching the console mode when the
    /// connector is silent.
    pub fn physical_size(&self) -> (u32, u32) {
        if self.mm_size.0 != 0 {
            return self.mm_size;
        }
        self.edid()
            .and_then(|edid| dtd_size_for_timing(&edid, &Timing::from_mode(&self.console_mode)))
            .unwrap_or((0, 0))
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        self.clear_rmfb();
        info!("releasing drm device {}", self.path.display());
    }
}

fn find_main_monitor(
    dev: &impl ControlDevice,
    resources: &ResourceHandles,
    lid_closed: bool,
) -> Result<(connector::Info, crtc::Handle)> {
    let mut chosen: Option<connector::Info> = None;

    // Internal panels win unless the lid is shut on them.
    if !lid_closed {
        'outer: for interface in INTERNAL_INTERFACES {
            for &handle in resources.connectors() {
                let Ok(conn) = dev.get_connector(handle, true) else {
                    continue;
                };
                if conn.interface() == interface && connected(&conn) {
                    chosen = Some(conn);
                    break 'outer;
                }
            }
        }
    }

    if chosen.is_none() {
        for &handle in resources.connectors() {
            let Ok(conn) = dev.get_connector(handle, true) else {
                continue;
            };
            if !is_internal(conn.interface()) && connected(&conn) {
                chosen = Some(conn);
                break;
            }
        }
    }

    let conn = chosen.ok_or(CinderError::NoDisplay)?;
    let crtc = match connector_crtc_path(dev, conn.handle()) {
        Some(crtc) => crtc,
        None => {
            crtc_with_most_planes(dev, resources, conn.handle()).ok_or(CinderError::NoDisplay)?
        }
    };
    Ok((conn, crtc))
}

/// CRTC the connector is currently wired to, if any.
fn connector_crtc_path(dev: &impl ControlDevice, handle: connector::Handle) -> Option<crtc::Handle> {
    let conn = dev.get_connector(handle, false).ok()?;
    let encoder = dev.get_encoder(conn.current_encoder()?).ok()?;
    encoder.crtc()
}

/// Among the CRTCs reachable from the connector's encoders, the one with
/// the most attachable planes, maximising the odds of a usable primary.
fn crtc_with_most_planes(
    dev: &impl ControlDevice,
    resources: &ResourceHandles,
    handle: connector::Handle,
) -> Option<crtc::Handle> {
    let conn = dev.get_connector(handle, false).ok()?;
    let planes = dev.plane_handles().ok()?;

    for &enc in conn.encoders() {
        let Ok(encoder) = dev.get_encoder(enc) else {
            continue;
        };
        let mut best: Option<(crtc::Handle, usize)> = None;
        for crtc in resources.filter_crtcs(encoder.possible_crtcs()) {
            let count = planes
                .iter()
                .filter(|&&p| {
                    dev.get_plane(p)
                        .map(|info| resources.filter_crtcs(info.possible_crtcs()).contains(&crtc))
                        .unwrap_or(false)
                })
                .count();
            if best.map(|(_, n)| count > n).unwrap_or(true) {
                best = Some((crtc, count));
            }
        }
        if let Some((crtc, _)) = best {
            return Some(crtc);
        }
    }
    None
}

fn connected(conn: &connector::Info) -> bool {
    conn.state() == connector::State::Connected && !conn.modes().is_empty()
}

fn is_internal(interface: connector::Interface) -> bool {
    INTERNAL_INTERFACES.contains(&interface)
}

/// Candidate score; higher wins. Internal panels beat externals, USB
/// display adapters lose ties, vgem is out of the running entirely.
fn score(internal: bool, driver: &str) -> i32 {
    let mut score = 0;
    if internal {
        score += 1;
    }
    match driver {
        "udl" | "evdi" => score -= 1,
        "vgem" => score -= 1_000_000,
        _ => {}
    }
    score
}

/// Scan all card minors and keep the best-scoring candidate. Master is
/// dropped on the winner before returning; the graphical session owns it
/// by default.
pub fn scan(lid_closed: bool) -> Option<Rc<Card>> {
    let mut best: Option<Card> = None;

    for minor in 0..MAX_CARD_MINORS {
        let path = PathBuf::from(format!("/dev/dri/card{minor}"));
        if !path.exists() {
            continue;
        }
        let card = match Card::probe(&path, lid_closed) {
            Ok(card) => card,
            Err(err) => {
                debug!("skipping {}: {err}", path.display());
                continue;
            }
        };
        let better = best
            .as_ref()
            .map(|b| {
                score(card.console_internal, &card.driver) > score(b.console_internal, &b.driver)
            })
            .unwrap_or(true);
        if better {
            best = Some(card);
        }
    }

    let card = best?;
    card.drop_master();
    if let Ok(driver) = card.get_driver() {
        info!(
            "console on {} ({}, {})",
            card.path.display(),
            driver.name().to_string_lossy(),
            driver.description().to_string_lossy(),
        );
    }
    if let Some(edid) = card.edid()
        && let Ok(parsed) = libdisplay_info::info::Info::parse_edid(&edid)
    {
        info!(make = ?parsed.make(), model = ?parsed.model(), "console monitor");
    }
    Some(Rc::new(card))
}

/// Result of a hotplug rescan.
pub enum Rescan {
    /// Same connector and CRTC; the previous device stays, master regained.
    Unchanged,
    /// A different display won; surfaces must be recreated against it.
    Changed(Option<Rc<Card>>),
}

pub fn rescan(current: Option<&Rc<Card>>, lid_closed: bool) -> Rescan {
    // Drop master so freshly probed candidates can take it while scoring.
    if let Some(card) = current {
        card.drop_master();
    }

    match scan(lid_closed) {
        Some(card) => {
            let unchanged = current
                .map(|old| {
                    old.console_connector == card.console_connector
                        && old.console_crtc.get() == card.console_crtc.get()
                })
                .unwrap_or(false);
            if unchanged {
                if let Some(old) = current {
                    let _ = old.acquire_master();
                }
                Rescan::Unchanged
            } else {
                Rescan::Changed(Some(card))
            }
        }
        None => {
            if current.is_some() {
                Rescan::Changed(None)
            } else {
                Rescan::Unchanged
            }
        }
    }
}

/// The timing fields a detailed timing descriptor is matched against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub clock_khz: u32,
    pub hdisplay: u32,
    pub vdisplay: u32,
    pub hsync_start: u32,
    pub hsync_end: u32,
    pub vsync_start: u32,
    pub vsync_end: u32,
}

impl Timing {
    pub fn from_mode(mode: &Mode) -> Timing {
        let (hdisplay, vdisplay) = mode.size();
        let (hsync_start, hsync_end, _) = mode.hsync();
        let (vsync_start, vsync_end, _) = mode.vsync();
        Timing {
            clock_khz: mode.clock(),
            hdisplay: hdisplay.into(),
            vdisplay: vdisplay.into(),
            hsync_start: hsync_start.into(),
            hsync_end: hsync_end.into(),
            vsync_start: vsync_start.into(),
            vsync_end: vsync_end.into(),
        }
    }
}

/// Millimetre image size from the EDID detailed timing descriptor whose
/// timing matches the console mode, if any.
pub fn dtd_size_for_timing(edid: &[u8], timing: &Timing) -> Option<(u32, u32)> {
    if edid.len() < EDID_SIZE {
        return None;
    }

    for dtd in edid[54..126].chunks_exact(18) {
        let clock_khz = u32::from(u16::from_le_bytes([dtd[0], dtd[1]])) * 10;
        if clock_khz == 0 {
            continue; // display descriptor, not a timing
        }

        let hactive = u32::from(dtd[2]) | (u32::from(dtd[4] & 0xF0) << 4);
        let vactive = u32::from(dtd[5]) | (u32::from(dtd[7] & 0xF0) << 4);
        let hsync_off = u32::from(dtd[8]) | (u32::from(dtd[11] & 0xC0) << 2);
        let hsync_width = u32::from(dtd[9]) | (u32::from(dtd[11] & 0x30) << 4);
        let vsync_off = u32::from(dtd[10] >> 4) | (u32::from(dtd[11] & 0x0C) << 2);
        let vsync_width = u32::from(dtd[10] & 0x0F) | (u32::from(dtd[11] & 0x03) << 4);

        let matches = clock_khz == timing.clock_khz
            && hactive == timing.hdisplay
            && vactive == timing.vdisplay
            && hactive + hsync_off == timing.hsync_start
            && hactive + hsync_off + hsync_width == timing.hsync_end
            && vactive + vsync_off == timing.vsync_start
            && vactive + vsync_off + vsync_width == timing.vsync_end;
        if !matches {
            continue;
        }

        let h_mm = u32::from(dtd[12]) | (u32::from(dtd[14] & 0xF0) << 4);
        let v_mm = u32::from(dtd[13]) | (u32::from(dtd[14] & 0x0F) << 8);
        return Some((h_mm, v_mm));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_prefers_internal_panels() {
        assert!(score(true, "i915") > score(false, "i915"));
    }

    #[test]
    fn score_penalizes_usb_adapters() {
        assert!(score(false, "i915") > score(false, "udl"));
        assert!(score(false, "i915") > score(false, "evdi"));
    }

    #[test]
    fn score_rules_out_vgem() {
        assert!(score(true, "vgem") < -100_000);
    }

    // 1366x768@60-ish timing used by the DTD tests below.
    fn timing() -> Timing {
        Timing {
            clock_khz: 76_300,
            hdisplay: 1366,
            vdisplay: 768,
            hsync_start: 1366 + 70,
            hsync_end: 1366 + 70 + 32,
            vsync_start: 768 + 3,
            vsync_end: 768 + 3 + 5,
        }
    }

    fn edid_with_dtd(timing: &Timing, h_mm: u32, v_mm: u32) -> Vec<u8> {
        let mut edid = vec![0u8; EDID_SIZE];
        let dtd = &mut edid[54..72];

        let clock = (timing.clock_khz / 10) as u16;
        dtd[0] = clock as u8;
        dtd[1] = (clock >> 8) as u8;

        let hblank = 120u32;
        dtd[2] = timing.hdisplay as u8;
        dtd[3] = hblank as u8;
        dtd[4] = (((timing.hdisplay >> 8) as u8) << 4) | ((hblank >> 8) as u8);

        let vblank = 20u32;
        dtd[5] = timing.vdisplay as u8;
        dtd[6] = vblank as u8;
        dtd[7] = (((timing.vdisplay >> 8) as u8) << 4) | ((vblank >> 8) as u8);

        let hs_off = timing.hsync_start - timing.hdisplay;
        let hs_width = timing.hsync_end - timing.hsync_start;
        let vs_off = timing.vsync_start - timing.vdisplay;
        let vs_width = timing.vsync_end - timing.vsync_start;
        dtd[8] = hs_off as u8;
        dtd[9] = hs_width as u8;
        dtd[10] = (((vs_off & 0x0F) as u8) << 4) | (vs_width & 0x0F) as u8;
        dtd[11] = (((hs_off >> 8) as u8) << 6)
            | (((hs_width >> 8) as u8) << 4)
            | (((vs_off >> 4) as u8) << 2)
            | (vs_width >> 4) as u8;

        dtd[12] = h_mm as u8;
        dtd[13] = v_mm as u8;
        dtd[14] = (((h_mm >> 8) as u8) << 4) | (v_mm >> 8) as u8;

        edid
    }

    #[test]
    fn dtd_matching_recovers_physical_size() {
        let timing = timing();
        let edid = edid_with_dtd(&timing, 293, 165);
        assert_eq!(dtd_size_for_timing(&edid, &timing), Some((293, 165)));
    }

    #[test]
    fn dtd_mismatched_timing_is_ignored() {
        let timing = timing();
        let edid = edid_with_dtd(&timing, 293, 165);
        let mut other = timing;
        other.clock_khz += 10;
        assert_eq!(dtd_size_for_timing(&edid, &other), None);
        let mut other = timing;
        other.hsync_end += 1;
        assert_eq!(dtd_size_for_timing(&edid, &other), None);
    }

    #[test]
    fn dtd_skips_non_timing_descriptors() {
        let edid = vec![0u8; EDID_SIZE];
        assert_eq!(dtd_size_for_timing(&edid, &timing()), None);
        let short = vec![0u8; 20];
        assert_eq!(dtd_size_for_timing(&short, &timing()), None);
    }
}
