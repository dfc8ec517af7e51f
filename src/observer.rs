//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use crate::session::Session;
use crate::sla::LatencyReport;

// Lifecycle operation reported to observers alongside a session (§6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigOp {
    Add,
    Update,
    Delete,
}

// Notification sink an external daemon process (control socket, routing
// integration) sits behind. The core never propagates errors upward; it
// reports through this trait instead (§7).
pub trait Observer {
    fn on_state_change(&mut self, session: &Session);
    fn on_config_change(&mut self, op: ConfigOp, session: &Session);
    fn on_sla_report(&mut self, session: &Session, report: &LatencyReport);
    fn on_loss_report(&mut self, session: &Session, loss_pct: f64);
}

impl<O: Observer + ?Sized> Observer for Box<O> {
    fn on_state_change(&mut self, session: &Session) {
        (**self).on_state_change(session);
    }
    fn on_config_change(&mut self, op: ConfigOp, session: &Session) {
        (**self).on_config_change(op, session);
    }
    fn on_sla_report(&mut self, session: &Session, report: &LatencyReport) {
        (**self).on_sla_report(session, report);
    }
    fn on_loss_report(&mut self, session: &Session, loss_pct: f64) {
        (**self).on_loss_report(session, loss_pct);
    }
}

// An observer that does nothing, for embedders with no external sink (and
// for tests that only care about FSM/registry state).
#[derive(Debug, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_state_change(&mut self, _session: &Session) {}
    fn on_config_change(&mut self, _op: ConfigOp, _session: &Session) {}
    fn on_sla_report(&mut self, _session: &Session, _report: &LatencyReport) {}
    fn on_loss_report(&mut self, _session: &Session, _loss_pct: f64) {}
}

// Interface/VRF resolver collaborator (§6). VRF and interface lookup
// through the host OS is a Non-goal beyond this seam: the core only ever
// calls through the trait.
pub trait InterfaceResolver {
    fn ifindex_of(&self, ifname: &str) -> Option<u32>;
    fn mac_of(&self, ifname: &str) -> Option<[u8; 6]>;
    fn vrf_of_interface(&self, ifname: &str) -> Option<String>;
}

// Resolver backed by the host network stack.
#[derive(Debug, Default)]
pub struct SystemInterfaceResolver;

impl InterfaceResolver for SystemInterfaceResolver {
    fn ifindex_of(&self, ifname: &str) -> Option<u32> {
        #[cfg(not(feature = "testing"))]
        {
            nix::net::if_::if_nametoindex(ifname).ok()
        }
        #[cfg(feature = "testing")]
        {
            let _ = ifname;
            None
        }
    }

    fn mac_of(&self, _ifname: &str) -> Option<[u8; 6]> {
        // Link-layer address lookup is only needed for single-hop echo
        // framing at Layer 2, which this core leaves to the transport
        // implementation that actually owns the raw socket.
        None
    }

    fn vrf_of_interface(&self, _ifname: &str) -> Option<String> {
        None
    }
}

// Socket provider collaborator (§6): creation and I/O for the UDP sockets
// a session's control/echo traffic rides on.
pub trait SocketProvider {
    type Handle;

    fn open_peer_socket(
        &self,
        ifname: Option<&str>,
        local: IpAddr,
        ttl: u8,
    ) -> Result<Self::Handle, std::io::Error>;
}
