//! Shared harness: scripted node peers driven over the in-process
//! transport, so every test exercises the full frame codec on both sides
//! of each exchange.

#![allow(dead_code)]

use std::thread::{self, JoinHandle};
use std::time::Duration;

use obnet::{
    AckStatus, Body, ChannelTransport, Coordinator, Error, EventRequest, MemorySink, Message,
    MessageKind, NodeId, SimTime, StopReason, SystemConfig, UpdateMask,
};

/// How long a peer waits for coordinator traffic before giving up.
const PEER_PATIENCE: Duration = Duration::from_secs(2);

/// Behavior of one scripted node peer.
#[derive(Clone)]
pub struct Script {
    pub name: String,
    pub block_count: u32,
    /// Send the registration request at startup.
    pub connect: bool,
    /// Announce a port before connecting.
    pub announce_port: Option<String>,
    /// Acknowledge SIM_INIT.
    pub ack_init: bool,
    /// Never acknowledge UPDATE_Y.
    pub silent_y: bool,
    /// Send every UPDATE_Y ack twice.
    pub double_ack_y: bool,
    /// Ack UPDATE_Y with this mask instead of the requested one.
    pub y_ack_mask_override: Option<UpdateMask>,
    /// Ack UPDATE_Y with a failure status code.
    pub fail_y_status: Option<u8>,
    /// Raw SIM_EVENT frames sent when UPDATE_Y arrives at the given time.
    pub events_at: Vec<(SimTime, EventRequest)>,
    /// Event requests piggybacked on the UPDATE_Y ack at the given time.
    pub piggyback_at: Vec<(SimTime, EventRequest)>,
    /// Drop the link right after acking SIM_INIT.
    pub drop_after_init: bool,
}

impl Script {
    pub fn new(name: impl Into<String>, block_count: u32) -> Self {
        Self {
            name: name.into(),
            block_count,
            connect: true,
            announce_port: None,
            ack_init: true,
            silent_y: false,
            double_ack_y: false,
            y_ack_mask_override: None,
            fail_y_status: None,
            events_at: Vec::new(),
            piggyback_at: Vec::new(),
            drop_after_init: false,
        }
    }

    pub fn silent_on_y(mut self) -> Self {
        self.silent_y = true;
        self
    }

    pub fn without_connect(mut self) -> Self {
        self.connect = false;
        self
    }

    pub fn without_init_ack(mut self) -> Self {
        self.ack_init = false;
        self
    }

    pub fn double_acking(mut self) -> Self {
        self.double_ack_y = true;
        self
    }

    pub fn acking_wrong_mask(mut self, mask: UpdateMask) -> Self {
        self.y_ack_mask_override = Some(mask);
        self
    }

    pub fn failing_y(mut self, code: u8) -> Self {
        self.fail_y_status = Some(code);
        self
    }

    pub fn event_at(mut self, when: SimTime, fire_time: SimTime, mask: UpdateMask) -> Self {
        self.events_at.push((when, EventRequest { fire_time, mask }));
        self
    }

    pub fn piggybacking(mut self, when: SimTime, fire_time: SimTime, mask: UpdateMask) -> Self {
        self.piggyback_at.push((when, EventRequest { fire_time, mask }));
        self
    }

    pub fn announcing(mut self, port: impl Into<String>) -> Self {
        self.announce_port = Some(port.into());
        self
    }

    pub fn dropping_after_init(mut self) -> Self {
        self.drop_after_init = true;
        self
    }
}

/// Everything one peer observed, in arrival order.
#[derive(Debug, Default)]
pub struct PeerLog {
    pub seq: Vec<(MessageKind, SimTime, UpdateMask)>,
}

impl PeerLog {
    pub fn ys(&self) -> Vec<(SimTime, UpdateMask)> {
        self.filtered(MessageKind::UpdateY)
    }

    pub fn xs(&self) -> Vec<(SimTime, UpdateMask)> {
        self.filtered(MessageKind::UpdateX)
    }

    pub fn terms(&self) -> usize {
        self.seq.iter().filter(|(k, _, _)| *k == MessageKind::Term).count()
    }

    pub fn inits(&self) -> usize {
        self.seq.iter().filter(|(k, _, _)| *k == MessageKind::Init).count()
    }

    fn filtered(&self, kind: MessageKind) -> Vec<(SimTime, UpdateMask)> {
        self.seq
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, t, m)| (*t, *m))
            .collect()
    }
}

fn run_peer(link: obnet::NodeLink, workspace: String, script: Script) -> PeerLog {
    let mut log = PeerLog::default();
    let me = link.node();

    if let Some(port) = &script.announce_port {
        link.send(&Message::new(0, me, 0, Body::SysOpenPort { port: port.clone() }));
    }
    if script.connect {
        link.send(&Message::new(
            0,
            me,
            0,
            Body::SysRequestConnect {
                workspace,
                name: script.name.clone(),
                block_count: script.block_count,
            },
        ));
    }

    while let Some(msg) = link.recv_timeout(PEER_PATIENCE) {
        let kind = msg.body.kind();
        match msg.body {
            Body::Init { .. } => {
                log.seq.push((kind, msg.time, msg.mask));
                if script.ack_init {
                    link.send(&Message::ack(msg.time, me, 0, MessageKind::Init));
                }
                if script.drop_after_init {
                    break;
                }
            }
            Body::UpdateY => {
                log.seq.push((kind, msg.time, msg.mask));
                for (when, req) in &script.events_at {
                    if *when == msg.time {
                        link.send(&Message::new(
                            msg.time,
                            me,
                            req.mask,
                            Body::Event { fire_time: req.fire_time },
                        ));
                    }
                }
                if script.silent_y {
                    continue;
                }
                if let Some(code) = script.fail_y_status {
                    link.send(&Message::new(
                        msg.time,
                        me,
                        msg.mask,
                        Body::Ack {
                            of: MessageKind::UpdateY,
                            status: AckStatus::Failed(code),
                            next_event: None,
                        },
                    ));
                    continue;
                }
                let mask = script.y_ack_mask_override.unwrap_or(msg.mask);
                let next_event = script
                    .piggyback_at
                    .iter()
                    .find(|(when, _)| *when == msg.time)
                    .map(|(_, req)| *req);
                let ack = Message::new(
                    msg.time,
                    me,
                    mask,
                    Body::Ack { of: MessageKind::UpdateY, status: AckStatus::Ok, next_event },
                );
                link.send(&ack);
                if script.double_ack_y {
                    link.send(&ack);
                }
            }
            Body::UpdateX => {
                log.seq.push((kind, msg.time, msg.mask));
                link.send(&Message::ack(msg.time, me, msg.mask, MessageKind::UpdateX));
            }
            Body::Term => {
                log.seq.push((kind, msg.time, msg.mask));
                link.send(&Message::ack(msg.time, me, 0, MessageKind::Term));
                break;
            }
            _ => {}
        }
    }

    log
}

/// Result of one federation run.
pub struct Federation {
    pub result: Result<StopReason, Error>,
    pub sink: MemorySink,
    pub logs: Vec<PeerLog>,
}

/// Launches the scripted peers, runs the coordinator to completion on the
/// current thread, and joins everything.
///
/// Script order must match the node declaration order in the config.
pub fn run_federation(config: SystemConfig, scripts: Vec<Script>) -> Federation {
    run_federation_with(config, scripts, |_| {})
}

/// Like [`run_federation`], with a hook between construction and `run`.
pub fn run_federation_with<F>(config: SystemConfig, scripts: Vec<Script>, before_run: F) -> Federation
where
    F: FnOnce(&Coordinator),
{
    let mut transport = ChannelTransport::new();
    let workspace = config.workspace.clone();

    let mut handles: Vec<JoinHandle<PeerLog>> = Vec::new();
    for (idx, script) in scripts.into_iter().enumerate() {
        let endpoint = format!("{}/{}", workspace, script.name);
        let link = transport.open_link(idx as NodeId, endpoint);
        let ws = workspace.clone();
        handles.push(thread::spawn(move || run_peer(link, ws, script)));
    }

    let sink = MemorySink::new();
    let mut coordinator =
        Coordinator::new(config, Box::new(transport), Box::new(sink.clone())).expect("valid config");
    before_run(&coordinator);
    let result = coordinator.run();
    drop(coordinator);

    let logs = handles
        .into_iter()
        .map(|h| h.join().expect("peer thread panicked"))
        .collect();

    Federation { result, sink, logs }
}

/// Asserts virtual time never decreases across tick starts.
pub fn assert_monotone(starts: &[SimTime]) {
    for pair in starts.windows(2) {
        assert!(pair[0] <= pair[1], "time went backwards: {pair:?}");
    }
}
