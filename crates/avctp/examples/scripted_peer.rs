/// Example driving AVCTP against a scripted in-process peer
///
/// The L2CAP layer here accepts every channel straight away and echoes each
/// command back as a response, so the whole connect, send and disconnect
/// cycle runs without a Bluetooth adapter.
use avctp::*;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedL2cap {
    events: Mutex<Option<EventSender>>,
    next_lcid: AtomicU16,
}

impl ScriptedL2cap {
    fn new() -> Self {
        Self {
            events: Mutex::new(None),
            next_lcid: AtomicU16::new(0x40),
        }
    }

    fn post(&self, event: L2capEvent) -> AvctResult<()> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        match events.as_ref() {
            Some(sender) => sender.post_l2cap(event),
            None => Err(AvctError::L2cap("no service registered".to_string())),
        }
    }
}

impl L2capService for ScriptedL2cap {
    fn register_service(&self, psm: u16, events: EventSender) -> AvctResult<()> {
        println!("L2CAP: listening on PSM 0x{:04X}", psm);
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(events);
        Ok(())
    }

    fn deregister_service(&self, psm: u16) {
        println!("L2CAP: closed PSM 0x{:04X}", psm);
    }

    fn connect_req(&self, peer: &BdAddr, psm: u16) -> AvctResult<ChannelId> {
        let lcid = self.next_lcid.fetch_add(1, Ordering::SeqCst);
        println!("L2CAP: connecting to {} on PSM 0x{:04X} (lcid 0x{:04X})", peer, psm, lcid);
        self.post(L2capEvent::ConnectRsp { lcid, result: 0 })?;
        self.post(L2capEvent::ConfigReq {
            lcid,
            identifier: 1,
            mtu: 48,
        })?;
        Ok(lcid)
    }

    fn connect_rsp(&self, _lcid: ChannelId, _identifier: u8, _result: u16) -> AvctResult<()> {
        Ok(())
    }

    fn config_req(&self, lcid: ChannelId, mtu: u16) -> AvctResult<()> {
        println!("L2CAP: configuring 0x{:04X} with mtu {}", lcid, mtu);
        self.post(L2capEvent::ConfigRsp { lcid, result: 0 })
    }

    fn config_rsp(&self, _lcid: ChannelId, _identifier: u8, _result: u16) -> AvctResult<()> {
        Ok(())
    }

    fn disconnect_req(&self, lcid: ChannelId) -> AvctResult<()> {
        self.post(L2capEvent::DisconnectRsp { lcid })
    }

    fn disconnect_rsp(&self, _lcid: ChannelId, _identifier: u8) -> AvctResult<()> {
        Ok(())
    }

    fn send_data(&self, lcid: ChannelId, mut data: Vec<u8>) -> AvctResult<()> {
        println!("L2CAP: tx 0x{:04X} {} bytes", lcid, data.len());
        // Turn each command packet into a response packet
        if let Some(first) = data.first_mut() {
            *first |= 0x02;
        }
        self.post(L2capEvent::Data { lcid, payload: data })
    }
}

struct AllowAll;

impl SecurityService for AllowAll {
    fn request_security(&self, request: SecurityRequest, on_result: SecurityCallback) -> AvctResult<()> {
        println!("Security: granting {} for {}", request.service, request.peer);
        on_result(0);
        Ok(())
    }
}

enum Update {
    Event(ChannelEvent),
    Message(Message),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("AVCTP Scripted Peer Example");
    println!("---------------------------");

    let avctp = Avctp::start(
        Arc::new(ScriptedL2cap::new()),
        Arc::new(AllowAll),
        DispatcherConfig::default(),
    )?;
    avctp.register(AvctConfig::default())?;

    let (tx, rx) = mpsc::channel();
    let message_tx = tx.clone();
    let params = ConnectParams::new(
        0x110E,
        Role::Initiator,
        move |event| {
            let _ = tx.send(Update::Event(event));
            Ok(())
        },
        move |message| {
            let _ = message_tx.send(Update::Message(message));
            Ok(())
        },
    );

    let peer = BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    let id = avctp.connect(params, peer)?;
    println!("Connection {} requested", id);

    let wait = |rx: &mpsc::Receiver<Update>| rx.recv_timeout(Duration::from_secs(2));

    if let Update::Event(event) = wait(&rx)? {
        println!("Event: {:?} ({:?}) from {}", event.kind, event.result, event.peer);
    }
    println!("Peer MTU: {}", avctp.peer_mtu(id)?);

    // Larger than the 48 byte MTU, so it goes out in fragments
    let payload: Vec<u8> = (0..120).collect();
    avctp.send_message(id, 5, CommandResponse::Command, &payload)?;

    // Fragments echo back one at a time; the last one completes the message
    if let Update::Message(message) = wait(&rx)? {
        println!(
            "Message: label {} {:?} on {} channel, {} bytes",
            message.label,
            message.cr,
            message.channel,
            message.payload.len()
        );
    }

    avctp.disconnect(id)?;
    if let Update::Event(event) = wait(&rx)? {
        println!("Event: {:?} ({:?})", event.kind, event.result);
    }

    avctp.deregister()?;
    Ok(())
}
