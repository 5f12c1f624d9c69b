//! X11 platform event source.
//!
//! Watches the root window of the session's screen and forwards the
//! notifications readiness depends on: the window manager publishing
//! `_NET_SUPPORTING_WM_CHECK`, and a tray host announcing ownership of
//! `_NET_SYSTEM_TRAY_S<n>` through a `MANAGER` client message. Conditions
//! that already hold when the watch starts are reported first.

use anyhow::{Context, Result};
use lxsm_core::PlatformEvent;
use lxsm_core::readiness::{MANAGER_MESSAGE, WM_CHECK_PROPERTY, tray_selection};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use x11rb::NONE;
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ChangeWindowAttributesAux, ConnectionExt as _, EventMask, Property, Window,
};
use x11rb::rust_connection::RustConnection;

/// Atoms and the root window the watch filters on.
#[derive(Debug, Clone, Copy)]
struct Atoms {
    screen: u32,
    root: Window,
    wm_check: Atom,
    tray: Atom,
    manager: Atom,
}

impl Atoms {
    fn translate(&self, event: &Event) -> Option<PlatformEvent> {
        match event {
            Event::PropertyNotify(ev)
                if ev.window == self.root
                    && ev.atom == self.wm_check
                    && ev.state == Property::NEW_VALUE =>
            {
                Some(PlatformEvent::window_manager_claimed())
            },
            Event::ClientMessage(ev)
                if ev.window == self.root
                    && ev.type_ == self.manager
                    && ev.format == 32
                    && ev.data.as_data32()[1] == self.tray =>
            {
                Some(PlatformEvent::ClientMessage {
                    message_type: MANAGER_MESSAGE.to_string(),
                    selection: tray_selection(self.screen),
                })
            },
            _ => None,
        }
    }
}

/// A connection to the X server listening on the root window.
pub struct X11Watch {
    conn: RustConnection,
    atoms: Atoms,
}

impl X11Watch {
    /// Connects to the display named by `DISPLAY` and subscribes to
    /// property and structure changes of the root window of `screen`.
    pub fn connect(screen: u32) -> Result<Self> {
        let (conn, _) = x11rb::connect(None).context("failed to connect to the X server")?;
        let root = usize::try_from(screen)
            .ok()
            .and_then(|index| conn.setup().roots.get(index))
            .map(|s| s.root)
            .with_context(|| format!("X screen {screen} does not exist"))?;

        let intern = |name: &str| -> Result<Atom> {
            Ok(conn
                .intern_atom(false, name.as_bytes())?
                .reply()
                .with_context(|| format!("failed to intern {name}"))?
                .atom)
        };
        let atoms = Atoms {
            screen,
            root,
            wm_check: intern(WM_CHECK_PROPERTY)?,
            tray: intern(&tray_selection(screen))?,
            manager: intern(MANAGER_MESSAGE)?,
        };

        let mask = EventMask::PROPERTY_CHANGE | EventMask::STRUCTURE_NOTIFY;
        conn.change_window_attributes(root, &ChangeWindowAttributesAux::new().event_mask(mask))?
            .check()
            .context("failed to select root window events")?;

        Ok(Self { conn, atoms })
    }

    /// Conditions that hold right now.
    fn current_state(&self) -> Result<Vec<PlatformEvent>> {
        let mut events = Vec::new();

        let wm_check = self
            .conn
            .get_property(
                false,
                self.atoms.root,
                self.atoms.wm_check,
                AtomEnum::WINDOW,
                0,
                1,
            )?
            .reply()?;
        if wm_check
            .value32()
            .and_then(|mut values| values.next())
            .is_some_and(|window| window != NONE)
        {
            events.push(PlatformEvent::window_manager_claimed());
        }

        let owner = self.conn.get_selection_owner(self.atoms.tray)?.reply()?.owner;
        if owner != NONE {
            events.push(PlatformEvent::tray_claimed(self.atoms.screen, owner));
        }
        Ok(events)
    }

    /// Forwards platform events to `tx` from a dedicated thread until the
    /// connection breaks or the receiver goes away.
    pub fn spawn(self, tx: mpsc::UnboundedSender<PlatformEvent>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            match self.current_state() {
                Ok(events) => {
                    for event in events {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                },
                Err(e) => warn!("failed to query initial X state: {e:#}"),
            }

            loop {
                let event = match self.conn.wait_for_event() {
                    Ok(event) => event,
                    Err(e) => {
                        error!("lost the X connection: {e}");
                        return;
                    },
                };
                if let Some(event) = self.atoms.translate(&event) {
                    debug!(?event, "platform event");
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        })
    }
}
