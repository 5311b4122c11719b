//! Terminal chat on top of the session manager: event printing and stdin commands.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use meshpeer_core::{
    DiscoveryInfo, EventSink, InboundStream, InvitationDecision, PeerIdentity, ResourceProgress, Role,
    SessionManager, TransferError, TransportError,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::lan::LanTransport;

pub type Manager = Arc<SessionManager<LanTransport>>;

/// Prints session events; parks invitations until the user answers.
pub struct ChatSink {
    auto_accept: bool,
    pending: Mutex<Vec<InvitationDecision>>,
}

impl ChatSink {
    pub fn new(auto_accept: bool) -> Self {
        Self {
            auto_accept,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Answer the oldest undecided invitation.
    fn answer(&self, accept: bool) {
        let decision = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.retain(|d| !d.is_decided());
            (!pending.is_empty()).then(|| pending.remove(0))
        };
        match decision {
            Some(d) => match d.decide(accept) {
                Ok(()) => println!("* {} {}", if accept { "accepted" } else { "declined" }, d.from_peer()),
                Err(e) => println!("* {e}"),
            },
            None => println!("* no pending invitation"),
        }
    }
}

impl EventSink for ChatSink {
    fn found_peer(&self, peer: &PeerIdentity, info: Option<&DiscoveryInfo>) {
        match info.filter(|i| !i.is_empty()) {
            Some(info) => println!("* found {peer} {info:?}"),
            None => println!("* found {peer}"),
        }
    }

    fn lost_peer(&self, peer: &PeerIdentity) {
        println!("* lost {peer}");
    }

    fn connected_to_peer(&self, peer: &PeerIdentity) {
        println!("* connected to {peer}");
    }

    fn disconnected_from_peer(&self, peer: &PeerIdentity) {
        println!("* disconnected from {peer}");
    }

    fn received_invite(&self, from: &PeerIdentity, _context: Option<&[u8]>, decision: InvitationDecision) {
        if self.auto_accept {
            if let Err(e) = decision.accept() {
                tracing::warn!(error = %e, "auto-accept failed");
            }
            println!("* accepted invitation from {from}");
            return;
        }
        println!("* {from} invites you: /accept or /reject");
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(decision);
    }

    fn did_receive_data(&self, data: &[u8], from: &PeerIdentity) {
        println!("[{}] {}", from.display_name(), String::from_utf8_lossy(data));
    }

    fn did_receive_stream(&self, _stream: InboundStream, name: &str, from: &PeerIdentity) {
        println!("* {from} opened stream {name:?} (ignored)");
    }

    fn did_start_receiving_resource(&self, name: &str, from: &PeerIdentity, progress: &ResourceProgress) {
        println!("* receiving {name:?} from {from} ({} bytes)", progress.total());
    }

    fn did_finish_receiving_resource(&self, name: &str, from: &PeerIdentity, result: Result<&Path, &TransferError>) {
        match result {
            Ok(path) => println!("* {name:?} from {from} saved to {}", path.display()),
            Err(e) => println!("* {name:?} from {from} failed: {e}"),
        }
    }

    fn encountered_error(&self, error: &TransportError) {
        println!("! {error}");
    }
}

/// One parsed line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Peers,
    Invite(&'a str),
    Accept,
    Reject,
    Send(&'a str),
    Quit,
    Help,
    Say(&'a str),
}

fn parse(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Say(line));
    };
    let (cmd, arg) = rest.split_once(' ').map_or((rest, ""), |(c, a)| (c, a.trim()));
    Some(match (cmd, arg) {
        ("peers", _) => Command::Peers,
        ("invite", a) if !a.is_empty() => Command::Invite(a),
        ("accept", _) => Command::Accept,
        ("reject", _) => Command::Reject,
        ("send", a) if !a.is_empty() => Command::Send(a),
        ("quit", _) => Command::Quit,
        _ => Command::Help,
    })
}

/// Visible peer whose display name or short id matches `who`.
fn find_peer(manager: &Manager, who: &str) -> Option<PeerIdentity> {
    manager
        .visible_peers()
        .into_iter()
        .find(|p| p.display_name() == who || p.id().short() == who)
}

/// Read stdin until EOF or /quit.
pub async fn run(manager: Manager, sink: Arc<ChatSink>) -> anyhow::Result<()> {
    println!("* {} on {:?}; /help for commands", manager.local_peer(), manager.config().service_type);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(cmd) = parse(&line) else {
            continue;
        };
        match cmd {
            Command::Peers => {
                for p in manager.visible_peers() {
                    println!("  {p} [{:?}]", manager.connection_state(&p));
                }
            }
            Command::Invite(who) => match find_peer(&manager, who) {
                Some(p) => manager.invite(&p),
                None => println!("* no visible peer named {who:?}"),
            },
            Command::Accept => sink.answer(true),
            Command::Reject => sink.answer(false),
            Command::Send(path) => send_file(&manager, Path::new(path)),
            Command::Quit => break,
            Command::Help => {
                println!("  /peers  /invite <name>  /accept  /reject  /send <path>  /quit");
            }
            Command::Say(text) => {
                if let Err(e) = manager.send_to_all(text.as_bytes()) {
                    println!("! {e}");
                }
            }
        }
    }
    manager.stop(Role::AllConnections);
    Ok(())
}

fn send_file(manager: &Manager, path: &Path) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let peers = manager.connected_peers();
    if peers.is_empty() {
        println!("* nobody connected");
    }
    for peer in peers {
        match manager.send_resource(path, &name, &peer) {
            Ok(_) => println!("* sending {name:?} to {peer}"),
            Err(e) => println!("! {e}"),
        }
    }
}
