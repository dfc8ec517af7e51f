//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::discriminator::DiscriminatorAllocator;
use crate::error::IoError;
use crate::fsm;
use crate::network::{self, PathType};
use crate::observer::{InterfaceResolver, NullObserver, Observer, SystemInterfaceResolver};
use crate::session::{Session, SessionId, SessionIndex, SessionKey, Sessions};
use crate::socket::{AddressFamily, TTL_MAX};
use crate::tasks::{self, messages::input::ProtocolMsg};
use crate::timer::{self, Task};

// The single explicitly-constructed daemon context (Design Notes §9): owns
// the discriminator allocator, the session registry, and the channels
// wiring UDP Rx and timer-fire events back into the state machine.
pub struct Master {
    pub sessions: Sessions,
    pub discriminator: DiscriminatorAllocator,
    pub labels: HashMap<String, SessionId>,
    pub observer: Box<dyn Observer + Send>,
    pub resolver: Box<dyn InterfaceResolver + Send>,
    udp_sh_rx_tasks: Option<UdpRxTasks>,
    udp_mh_rx_tasks: Option<UdpRxTasks>,
    pub(crate) input_tx: ProtocolInputChannelsTx,
    input_rx: ProtocolInputChannelsRx,
}

// One Rx task per address family sharing the path type's well-known port.
struct UdpRxTasks {
    _ipv4: Option<Task<()>>,
    _ipv6: Option<Task<()>>,
}

#[derive(Clone)]
pub(crate) struct ProtocolInputChannelsTx {
    pub udp_packet_rx: Sender<tasks::messages::input::UdpRxPacketMsg>,
    pub echo_packet_rx: Sender<tasks::messages::input::EchoRxPacketMsg>,
    pub detect_timer: Sender<tasks::messages::input::DetectTimerMsg>,
    pub echo_detect_timer: Sender<tasks::messages::input::EchoDetectTimerMsg>,
}

struct ProtocolInputChannelsRx {
    udp_packet_rx: Receiver<tasks::messages::input::UdpRxPacketMsg>,
    echo_packet_rx: Receiver<tasks::messages::input::EchoRxPacketMsg>,
    detect_timer: Receiver<tasks::messages::input::DetectTimerMsg>,
    echo_detect_timer: Receiver<tasks::messages::input::EchoDetectTimerMsg>,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl Default for Master {
    fn default() -> Master {
        Master::new(Box::new(NullObserver), Box::new(SystemInterfaceResolver))
    }
}

impl Master {
    pub fn new(
        observer: Box<dyn Observer + Send>,
        resolver: Box<dyn InterfaceResolver + Send>,
    ) -> Master {
        let (udp_packet_rxp, udp_packet_rxc) = mpsc::channel(64);
        let (echo_packet_rxp, echo_packet_rxc) = mpsc::channel(64);
        let (detect_timerp, detect_timerc) = mpsc::channel(64);
        let (echo_detect_timerp, echo_detect_timerc) = mpsc::channel(64);

        Master {
            sessions: Sessions::new(),
            discriminator: DiscriminatorAllocator::new(),
            labels: HashMap::new(),
            observer,
            resolver,
            udp_sh_rx_tasks: None,
            udp_mh_rx_tasks: None,
            input_tx: ProtocolInputChannelsTx {
                udp_packet_rx: udp_packet_rxp,
                echo_packet_rx: echo_packet_rxp,
                detect_timer: detect_timerp,
                echo_detect_timer: echo_detect_timerp,
            },
            input_rx: ProtocolInputChannelsRx {
                udp_packet_rx: udp_packet_rxc,
                echo_packet_rx: echo_packet_rxc,
                detect_timer: detect_timerc,
                echo_detect_timer: echo_detect_timerc,
            },
        }
    }

    // Runs the single-threaded cooperative event loop (§5): selects over
    // the UDP-receive and timer-fire channels, dispatching each event to
    // the FSM. Suspension happens only at the `select!` below.
    pub async fn run(&mut self) {
        loop {
            let msg = tokio::select! {
                msg = self.input_rx.udp_packet_rx.recv() => {
                    msg.map(ProtocolMsg::UdpRxPacket)
                }
                msg = self.input_rx.echo_packet_rx.recv() => {
                    msg.map(ProtocolMsg::EchoRxPacket)
                }
                msg = self.input_rx.detect_timer.recv() => {
                    msg.map(ProtocolMsg::DetectTimer)
                }
                msg = self.input_rx.echo_detect_timer.recv() => {
                    msg.map(ProtocolMsg::EchoDetectTimer)
                }
            };
            let Some(msg) = msg else {
                // All senders dropped: nothing left to drive the loop.
                return;
            };
            self.process_message(msg);
        }
    }

    fn process_message(&mut self, msg: ProtocolMsg) {
        let result = match msg {
            ProtocolMsg::UdpRxPacket(msg) => {
                fsm::process_control_packet(self, msg.packet_info, msg.packet)
            }
            ProtocolMsg::EchoRxPacket(msg) => {
                fsm::process_echo_packet(self, msg.my_discr)
            }
            ProtocolMsg::DetectTimer(msg) => {
                fsm::process_detection_timer_expiry(self, msg.sess_id)
            }
            ProtocolMsg::EchoDetectTimer(msg) => {
                fsm::process_echo_detection_timer_expiry(self, msg.sess_id)
            }
        };
        if let Err(error) = result {
            error.log();
        }
    }

    // Starts or stops the shared Rx sockets depending on whether any
    // session of that path type exists, to avoid opening sockets that
    // aren't needed.
    pub(crate) fn update_udp_rx_tasks(&mut self) {
        let has_shop = self.sessions.iter().any(|sess| sess.key.is_single_hop());
        let has_mhop = self.sessions.iter().any(|sess| sess.key.is_multihop());

        if has_shop && self.udp_sh_rx_tasks.is_none() {
            self.udp_sh_rx_tasks = Some(UdpRxTasks::new(
                PathType::IpSingleHop,
                &self.input_tx.udp_packet_rx,
            ));
        } else if !has_shop {
            self.udp_sh_rx_tasks = None;
        }

        if has_mhop && self.udp_mh_rx_tasks.is_none() {
            self.udp_mh_rx_tasks = Some(UdpRxTasks::new(
                PathType::IpMultihop,
                &self.input_tx.udp_packet_rx,
            ));
        } else if !has_mhop {
            self.udp_mh_rx_tasks = None;
        }
    }

    // Creates (or refreshes) the Tx socket for a session and (re)arms its
    // transmit/detect timers according to its current negotiated values
    // (§4.D). Called after every state transition and parameter change.
    pub(crate) fn rearm_session_timers(&mut self, sess_idx: SessionIndex) {
        if self.sessions[sess_idx].state.socket_tx.is_none() {
            let sess = &mut self.sessions[sess_idx];
            if let Err(error) = open_tx_socket(sess) {
                IoError::UdpSocketError(error).log();
            }
        }

        let sess = &self.sessions[sess_idx];
        let socket_tx = sess.state.socket_tx.clone();
        let sockaddr = sess.state.sockaddr;
        let interval = sess.negotiated_tx_interval();
        let local_multiplier = sess.local_multiplier();

        match (socket_tx, sockaddr, interval) {
            (Some(socket_tx), Some(sockaddr), Some(interval)) => {
                let jittered = timer::jittered_interval(
                    interval,
                    local_multiplier,
                    &mut rand::rng(),
                );
                let sess = &mut self.sessions[sess_idx];
                sess.state.last_xmit_ts = Some(chrono::Utc::now());
                let task = tasks::udp_tx_interval(sess, jittered, &socket_tx, sockaddr);
                self.sessions[sess_idx].state.tx_interval = Some(task);
            }
            _ => {
                self.sessions[sess_idx].state.tx_interval = None;
            }
        }

        if self.sessions[sess_idx].detection_time().is_some() {
            let sess = &self.sessions[sess_idx];
            let task = tasks::detection_timer(sess, &self.input_tx.detect_timer);
            self.sessions[sess_idx].state.detection_timer = Some(task);
        } else {
            self.sessions[sess_idx].state.detection_timer = None;
        }

        if self.sessions[sess_idx].state.echo_active {
            self.rearm_echo_timers(sess_idx);
        }
    }

    // Arms the echo transmit interval and the echo detection timer once the
    // echo function has been activated for a session (§4.D, invariant 4).
    pub(crate) fn rearm_echo_timers(&mut self, sess_idx: SessionIndex) {
        let sess = &self.sessions[sess_idx];
        let socket_tx = sess.state.socket_tx.clone();
        let sockaddr = sess.state.sockaddr;
        let interval = sess.echo_negotiated_interval();
        let local_multiplier = sess.local_multiplier();

        let (Some(socket_tx), Some(mut echo_sockaddr), Some(interval)) =
            (socket_tx, sockaddr, interval)
        else {
            self.sessions[sess_idx].state.echo_tx_interval = None;
            return;
        };
        echo_sockaddr.set_port(network::PORT_DST_ECHO);
        let jittered =
            timer::jittered_interval(interval, local_multiplier, &mut rand::rng());

        let sess = &mut self.sessions[sess_idx];
        sess.state.last_echo_xmit_ts = Some(chrono::Utc::now());
        let task = tasks::echo_tx_interval(sess, jittered, &socket_tx, echo_sockaddr);
        self.sessions[sess_idx].state.echo_tx_interval = Some(task);

        self.rearm_echo_detection_timer(sess_idx);
    }

    pub(crate) fn rearm_echo_detection_timer(&mut self, sess_idx: SessionIndex) {
        let sess = &self.sessions[sess_idx];
        if sess.detection_time().is_none() {
            self.sessions[sess_idx].state.echo_detection_timer = None;
            return;
        }
        let task = tasks::echo_detection_timer(sess, &self.input_tx.echo_detect_timer);
        self.sessions[sess_idx].state.echo_detection_timer = Some(task);
    }

    // Answers an immediate Poll with a Final-bit packet, independent of
    // the transmit timer (§4.D).
    pub(crate) fn send_final(&mut self, sess_idx: SessionIndex) {
        let sess = &self.sessions[sess_idx];
        if let (Some(socket_tx), Some(sockaddr)) =
            (&sess.state.socket_tx, sess.state.sockaddr)
        {
            tasks::udp_tx_final(sess, socket_tx, sockaddr);
        }
    }

    // Tears down a session's timers and Tx socket, e.g. on AdminDown or
    // delete (§4.E).
    pub(crate) fn disarm_session(&mut self, sess_idx: SessionIndex) {
        let sess = &mut self.sessions[sess_idx];
        sess.state.tx_interval = None;
        sess.state.detection_timer = None;
        sess.state.echo_tx_interval = None;
        sess.state.echo_detection_timer = None;
        sess.state.socket_tx = None;
        sess.state.sockaddr = None;
    }
}

fn open_tx_socket(sess: &mut Session) -> Result<(), std::io::Error> {
    let (ifname, af, src, ttl) = match &sess.key {
        SessionKey::SingleHop { ifname, peer } => {
            let af = AddressFamily::of(*peer);
            let src = sess.config.src.unwrap_or_else(|| af.unspecified());
            (ifname.as_deref(), af, src, TTL_MAX)
        }
        SessionKey::MultiHop { local, peer, .. } => {
            let af = AddressFamily::of(*peer);
            let ttl = sess.config.tx_ttl.unwrap_or(TTL_MAX);
            (None, af, *local, ttl)
        }
    };

    let socket = network::socket_tx(ifname, af, src, ttl)?;
    sess.state.socket_tx = Some(Arc::new(socket));

    let port = match sess.key.path_type() {
        PathType::IpSingleHop => network::PORT_DST_SINGLE_HOP,
        PathType::IpMultihop => network::PORT_DST_MULTIHOP,
    };
    sess.state.sockaddr = Some(std::net::SocketAddr::new(sess.key.peer(), port));

    Ok(())
}

impl UdpRxTasks {
    fn new(
        path_type: PathType,
        udp_packet_rxp: &Sender<tasks::messages::input::UdpRxPacketMsg>,
    ) -> Self {
        let spawn = |af| match network::socket_rx(path_type, af) {
            Ok(socket) => Some(tasks::udp_rx(socket, path_type, udp_packet_rxp)),
            Err(error) => {
                IoError::UdpSocketError(error).log();
                None
            }
        };
        UdpRxTasks {
            _ipv4: spawn(AddressFamily::Ipv4),
            _ipv6: spawn(AddressFamily::Ipv6),
        }
    }
}

impl std::fmt::Debug for UdpRxTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRxTasks").finish_non_exhaustive()
    }
}
