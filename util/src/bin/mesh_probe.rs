//! Dials a gateway, requests its configuration and dumps every decoded
//! record until the sentinel arrives. Quick sanity probe for a device.

use meshwork::net::frame::{encode_frame, FrameReader};
use meshwork::net::link::dial_target;
use meshwork::proto::{FromRadio, ToRadio};
use prost::Message;
use std::io::{Read, Write};
use std::net::TcpStream;

fn main() {
    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "localhost".to_string());
    let target = dial_target(&target, meshwork::DEFAULT_DEVICE_PORT);

    println!("connecting to {}", target);

    let mut stream = TcpStream::connect(&target).expect("connect failed");
    stream.set_nodelay(true).unwrap();

    let config_id = 0x0ddba11;
    stream
        .write_all(&encode_frame(
            &ToRadio::want_config(config_id).encode_to_vec(),
        ))
        .expect("handshake write failed");

    let mut frames = FrameReader::new(None);
    let mut buf = [0u8; 4096];

    loop {
        let count = stream.read(&mut buf).expect("read failed");

        if count == 0 {
            println!("connection closed");
            return;
        }

        frames.extend(&buf[..count]);

        while let Some(frame) = frames.next_frame() {
            match FromRadio::decode(frame) {
                Ok(record) => {
                    describe(&record);

                    if record.config_complete_id == config_id {
                        println!("config complete");
                        return;
                    }
                }
                Err(err) => println!("undecodable frame ({} bytes): {}", frame.len(), err),
            }
        }
    }
}

fn describe(record: &FromRadio) {
    if let Some(info) = &record.my_info {
        println!("my_info node={:08x}", info.my_node_num);
    }
    if let Some(node) = &record.node_info {
        let name = node
            .user
            .as_ref()
            .map(|user| user.long_name.as_str())
            .unwrap_or("");
        println!("node_info num={:08x} name={:?}", node.num, name);
    }
    if let Some(channel) = &record.channel {
        println!(
            "channel index={} role={} name={:?}",
            channel.index,
            channel.role,
            channel
                .settings
                .as_ref()
                .map(|s| s.name.as_str())
                .unwrap_or("")
        );
    }
    if record.config.is_some() {
        println!("config fragment");
    }
    if record.module_config.is_some() {
        println!("module config fragment");
    }
    if let Some(metadata) = &record.metadata {
        println!("metadata fw={}", metadata.firmware_version);
    }
    if let Some(packet) = &record.packet {
        println!(
            "packet from={:08x} to={:08x} port={}",
            packet.from,
            packet.to,
            packet
                .decoded
                .as_ref()
                .map(|data| data.portnum)
                .unwrap_or(-1)
        );
    }
}
