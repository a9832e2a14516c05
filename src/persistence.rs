// src/persistence.rs

//! `nodes.conf` topology persistence: a human-readable snapshot of every
//! known node plus the epoch counters, written atomically and guarded by an
//! advisory PID-sentinel lock file (the same guard idiom the host store uses
//! for its AOF directory, applied here instead of adding a new dependency
//! family for file locking).

use crate::errors::ClusterError;
use crate::node::{ClusterNode, NodeFlags, NodeRole};
use crate::registry::NodeRegistry;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Advisory lock over the topology file, held for the process lifetime.
/// Dropped (and the sentinel removed) when the guard goes out of scope.
pub struct TopologyLock {
    sentinel_path: PathBuf,
}

impl TopologyLock {
    pub fn acquire(nodes_conf_path: &Path) -> Result<Self, ClusterError> {
        let sentinel_path = sentinel_for(nodes_conf_path);
        if sentinel_path.exists() {
            let existing_pid = std::fs::read_to_string(&sentinel_path).unwrap_or_default();
            return Err(ClusterError::TopologyFile(format!(
                "nodes.conf is locked by pid {existing_pid}; refusing to start a second instance against it"
            )));
        }
        std::fs::write(&sentinel_path, std::process::id().to_string())
            .map_err(|e| ClusterError::TopologyFile(e.to_string()))?;
        Ok(Self { sentinel_path })
    }
}

impl Drop for TopologyLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.sentinel_path);
    }
}

fn sentinel_for(nodes_conf_path: &Path) -> PathBuf {
    let mut name = nodes_conf_path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    nodes_conf_path.with_file_name(name)
}

fn format_slot_ranges(slots: &BTreeSet<u16>) -> Vec<String> {
    let mut ranges = Vec::new();
    let mut iter = slots.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().unwrap();
        }
        if start == end {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{start}-{end}"));
        }
    }
    ranges
}

fn serialize_node(node: &ClusterNode, connected: bool, ping_sent_secs: u64, pong_received_secs: u64) -> String {
    let master_field = node.replica_of.as_deref().unwrap_or("-");
    let mut line = format!(
        "{} {} {} {} {} {} {} {}",
        node.id,
        node.addr,
        node.flags().to_csv(),
        master_field,
        ping_sent_secs,
        pong_received_secs,
        node.config_epoch,
        if connected { "connected" } else { "disconnected" },
    );
    for range in format_slot_ranges(&node.slots) {
        line.push(' ');
        line.push_str(&range);
    }
    for (slot, dest) in &node.migrating_slots {
        line.push_str(&format!(" [{slot}->-{dest}]"));
    }
    for (slot, source) in &node.importing_slots {
        line.push_str(&format!(" [{slot}-<-{source}]"));
    }
    line
}

/// Serializes the full topology to the `nodes.conf` text format: one line
/// per known node plus a trailing `vars` line carrying the epoch counters.
pub fn serialize(registry: &NodeRegistry, current_epoch: u64, last_vote_epoch: u64) -> String {
    let mut lines: Vec<String> = registry
        .iter()
        .map(|entry| {
            let state = entry.value();
            let connected = !state.info.flags().intersects(NodeFlags::HANDSHAKE | NodeFlags::NOADDR);
            let ping_secs = state.ping_sent.map(|t| t.elapsed().as_secs()).unwrap_or(0);
            let pong_secs = state.pong_received.map(|t| t.elapsed().as_secs()).unwrap_or(0);
            serialize_node(&state.info, connected, ping_secs, pong_secs)
        })
        .collect();
    lines.sort();
    lines.push(format!("vars currentEpoch {current_epoch} lastVoteEpoch {last_vote_epoch}"));
    lines.join("\n") + "\n"
}

/// Atomically overwrites `path` with `contents`: writes to a sibling temp
/// file and renames over the target, so a crash mid-write never leaves a
/// truncated topology file. If the new contents are shorter than the file
/// being replaced, the rename still wins outright (no partial-file padding
/// is needed once the write goes through a temp file).
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), ClusterError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path).map_err(|e| ClusterError::TopologyFile(e.to_string()))?;
        f.write_all(contents.as_bytes()).map_err(|e| ClusterError::TopologyFile(e.to_string()))?;
        f.sync_all().map_err(|e| ClusterError::TopologyFile(e.to_string()))?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| ClusterError::TopologyFile(e.to_string()))?;
    Ok(())
}

struct ParsedLine {
    id: String,
    addr_field: String,
    flags_csv: String,
    master_field: String,
    config_epoch: u64,
    slot_ranges: Vec<String>,
}

fn parse_addr(field: &str) -> Result<crate::node::NodeAddr, ClusterError> {
    let (hostport, bus_and_plain) = field
        .split_once('@')
        .ok_or_else(|| ClusterError::TopologyFile(format!("malformed address field '{field}'")))?;
    let (ip, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| ClusterError::TopologyFile(format!("malformed host:port in '{field}'")))?;
    let client_port: u16 = port.parse().map_err(|_| ClusterError::TopologyFile(format!("bad port in '{field}'")))?;
    let mut parts = bus_and_plain.split(',');
    let bus_port: u16 = parts
        .next()
        .ok_or_else(|| ClusterError::TopologyFile(format!("missing bus port in '{field}'")))?
        .parse()
        .map_err(|_| ClusterError::TopologyFile(format!("bad bus port in '{field}'")))?;
    let plaintext_port = match parts.next() {
        Some(p) => Some(p.parse().map_err(|_| ClusterError::TopologyFile(format!("bad plaintext port in '{field}'")))?),
        None => None,
    };
    Ok(crate::node::NodeAddr { ip: ip.to_string(), client_port, bus_port, plaintext_port })
}

fn parse_line(line: &str) -> Option<ParsedLine> {
    let mut fields = line.split_whitespace();
    let id = fields.next()?.to_string();
    let addr_field = fields.next()?.to_string();
    let flags_csv = fields.next()?.to_string();
    let master_field = fields.next()?.to_string();
    let _ping_secs = fields.next()?;
    let _pong_secs = fields.next()?;
    let config_epoch: u64 = fields.next()?.parse().ok()?;
    let _connected = fields.next()?;
    let slot_ranges: Vec<String> = fields.map(|s| s.to_string()).collect();
    Some(ParsedLine { id, addr_field, flags_csv, master_field, config_epoch, slot_ranges })
}

fn slots_from_ranges(ranges: &[String]) -> BTreeSet<u16> {
    let mut slots = BTreeSet::new();
    for range in ranges {
        if range.starts_with('[') {
            continue; // migration/import markers handled separately by caller
        }
        if let Some((start, end)) = range.split_once('-') {
            if let (Ok(s), Ok(e)) = (start.parse::<u16>(), end.parse::<u16>()) {
                slots.extend(s..=e);
            }
        } else if let Ok(s) = range.parse::<u16>() {
            slots.insert(s);
        }
    }
    slots
}

/// Parses a `nodes.conf` file's contents back into node records plus the
/// epoch counters from the trailing `vars` line.
pub fn parse(contents: &str) -> Result<(Vec<ClusterNode>, u64, u64), ClusterError> {
    let mut nodes = Vec::new();
    let mut current_epoch = 0u64;
    let mut last_vote_epoch = 0u64;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("vars ") {
            let mut tokens = rest.split_whitespace();
            while let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
                match key {
                    "currentEpoch" => current_epoch = value.parse().unwrap_or(0),
                    "lastVoteEpoch" => last_vote_epoch = value.parse().unwrap_or(0),
                    _ => {}
                }
            }
            continue;
        }
        let Some(parsed) = parse_line(line) else {
            return Err(ClusterError::TopologyFile(format!("malformed nodes.conf line: '{line}'")));
        };
        let flags = parse_flags_csv(&parsed.flags_csv);
        let role = if flags.contains(NodeFlags::REPLICA) { NodeRole::Replica } else { NodeRole::Primary };
        let replica_of = if parsed.master_field == "-" { None } else { Some(parsed.master_field) };
        let addr = parse_addr(&parsed.addr_field)?;
        nodes.push(ClusterNode {
            id: parsed.id,
            addr,
            role,
            flags: flags.bits(),
            replica_of,
            slots: slots_from_ranges(&parsed.slot_ranges),
            config_epoch: parsed.config_epoch,
            replication_offset: 0,
            migrating_slots: Default::default(),
            importing_slots: Default::default(),
        });
    }
    Ok((nodes, current_epoch, last_vote_epoch))
}

fn parse_flags_csv(csv: &str) -> NodeFlags {
    let mut flags = NodeFlags::empty();
    for token in csv.split(',') {
        match token {
            "myself" => flags |= NodeFlags::MYSELF,
            "master" => flags |= NodeFlags::PRIMARY,
            "slave" => flags |= NodeFlags::REPLICA,
            "fail" => flags |= NodeFlags::FAIL,
            "fail?" => flags |= NodeFlags::PFAIL,
            "handshake" => flags |= NodeFlags::HANDSHAKE,
            "noaddr" => flags |= NodeFlags::NOADDR,
            _ => {}
        }
    }
    flags
}
