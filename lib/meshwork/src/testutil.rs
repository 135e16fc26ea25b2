//! Shared test harness: a session driven over an in-memory pipe, with the
//! test playing the physical gateway.

use crate::events::MeshEvent;
use crate::net::link::{Dialer, LinkConfig, LinkManager, Transport};
use crate::net::testing::{pipe, PipeTransport, RemoteEnd};
use crate::proto;
use crate::session::RadioSession;
use crate::state::MeshState;
use ferrite::NodeNum;
use prost::Message;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const LOCAL: NodeNum = 0x1234_5678;

pub struct OneShotDialer {
    pub transport: Option<PipeTransport>,
}

impl Dialer for OneShotDialer {
    fn dial(&mut self) -> io::Result<Box<dyn Transport>> {
        match self.transport.take() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(io::ErrorKind::ConnectionRefused.into()),
        }
    }
}

pub struct Harness {
    pub link: LinkManager,
    pub session: Arc<RadioSession>,
    pub remote: RemoteEnd,
    pub events: Receiver<MeshEvent>,
    pub ready_count: Arc<AtomicUsize>,
}

pub fn harness() -> Harness {
    let state = Arc::new(MeshState::ephemeral());
    let (transport, remote) = pipe();
    let (link_tx, link_rx) = channel();

    let link = LinkManager::spawn(
        LinkConfig::new("test"),
        OneShotDialer {
            transport: Some(transport),
        },
        link_tx,
        None,
    );

    let session = RadioSession::new(state, link.handle(), None);
    let events = session.subscribe_events();

    let ready_count = Arc::new(AtomicUsize::new(0));
    let counter = ready_count.clone();
    session.set_on_ready(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.run(link_rx);

    Harness {
        link,
        session,
        remote,
        events,
        ready_count,
    }
}

pub fn recv_to_radio(remote: &mut RemoteEnd) -> proto::ToRadio {
    let frame = remote.recv_frame().expect("Expected an outbound record");
    proto::ToRadio::decode(&frame[..]).expect("Malformed outbound record")
}

pub fn send_from_radio(remote: &mut RemoteEnd, record: proto::FromRadio) {
    remote.send_frame(&record.encode_to_vec());
}

/// Plays the device side of the capture handshake: local node info, one
/// extra known node, the primary channel, then the sentinel.
pub fn complete_capture(remote: &mut RemoteEnd) -> u32 {
    let handshake = recv_to_radio(remote);
    let config_id = handshake.want_config_id;
    assert_ne!(config_id, 0);

    send_from_radio(
        remote,
        proto::FromRadio {
            my_info: Some(proto::MyNodeInfo {
                my_node_num: LOCAL,
                ..proto::MyNodeInfo::default()
            }),
            ..proto::FromRadio::default()
        },
    );
    send_from_radio(
        remote,
        proto::FromRadio {
            node_info: Some(proto::NodeInfo {
                num: LOCAL,
                user: Some(proto::User {
                    long_name: "GW".into(),
                    ..proto::User::default()
                }),
                ..proto::NodeInfo::default()
            }),
            ..proto::FromRadio::default()
        },
    );
    send_from_radio(
        remote,
        proto::FromRadio {
            channel: Some(proto::Channel {
                index: 0,
                settings: Some(proto::ChannelSettings::default()),
                role: proto::ChannelRole::Primary as i32,
            }),
            ..proto::FromRadio::default()
        },
    );
    send_from_radio(
        remote,
        proto::FromRadio {
            config_complete_id: config_id,
            ..proto::FromRadio::default()
        },
    );

    config_id
}

pub fn wait_for_ready(harness: &Harness) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        match harness.events.recv_timeout(Duration::from_millis(200)) {
            Ok(MeshEvent::CaptureComplete) => return,
            Ok(_) => continue,
            Err(_) => continue,
        }
    }

    panic!("Capture never completed");
}

pub fn teardown(harness: Harness) {
    harness.link.handle().disconnect();
    let mut remote = harness.remote;
    remote.close();
    harness.link.join();
}
