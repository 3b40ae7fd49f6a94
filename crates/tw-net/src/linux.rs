//! Linux System Backends
//!
//! Drives the host through its command-line tools: iproute2 `ip` for
//! links, addresses and routes, `resolvectl` for per-link DNS, `nft` for
//! the firewall, and `/proc/sys` for per-family interface parameters.
//!
//! Linux has no per-interface metric. The metric the reconciler asks for is
//! reported back unchanged and routes carry their own metric instead. Routes
//! are only ever added, never replaced, so host routes outside the tunnel
//! are left alone.

use crate::config::TunnelName;
use crate::device::{DeviceError, DeviceProvider, TunnelDevice};
use crate::firewall::{Firewall, FirewallError, FirewallPosture};
use crate::stack::{
    Adapter, AddressFamily, InterfaceId, IpInterface, NetworkStack, OperStatus, Route, StackError,
};
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the nftables table owned by the firewall backend
pub const NFT_TABLE: &str = "tunwarden";

/// Failure running an external tool
#[derive(Debug)]
enum CommandError {
    Spawn(String),
    Failed(String),
}

impl CommandError {
    fn message(&self) -> &str {
        match self {
            CommandError::Spawn(m) | CommandError::Failed(m) => m,
        }
    }

    /// iproute2 and route(8) both report duplicates as "File exists"
    fn is_already_exists(&self) -> bool {
        matches!(self, CommandError::Failed(m) if m.contains("File exists"))
    }

    fn is_not_found(&self) -> bool {
        matches!(self, CommandError::Failed(m)
            if m.contains("No such device")
                || m.contains("Cannot find device")
                || m.contains("No such file or directory")
                || m.contains("Cannot assign requested address"))
    }

    fn into_stack(self, op: &'static str, what: String) -> StackError {
        if self.is_already_exists() {
            StackError::AlreadyExists(what)
        } else if self.is_not_found() {
            StackError::NotFound(what)
        } else {
            StackError::os(op, self.message())
        }
    }
}

fn run(program: &str, args: &[&str]) -> Result<String, CommandError> {
    run_with_input(program, args, None)
}

fn run_with_input(program: &str, args: &[&str], input: Option<&str>) -> Result<String, CommandError> {
    debug!("{} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CommandError::Spawn(format!("{}: {}", program, e)))?;

    if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(text.as_bytes())
            .map_err(|e| CommandError::Spawn(format!("{} stdin: {}", program, e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| CommandError::Spawn(format!("{}: {}", program, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CommandError::Failed(stderr.trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Prefixes actually installed for a route destination
///
/// A default route goes in as its two halves. They are more specific than
/// the host's own default route, so they win without replacing it, and
/// flushing the device takes them away again.
fn route_destinations(destination: &IpNet) -> Vec<IpNet> {
    if destination.prefix_len() == 0 {
        if let Ok(halves) = destination.subnets(1) {
            return halves.collect();
        }
    }
    vec![*destination]
}

fn family_flag(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::Ipv4 => "-4",
        AddressFamily::Ipv6 => "-6",
    }
}

/// `ip -j addr show` entry
#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    operstate: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: IpAddr,
    prefixlen: u8,
}

fn parse_oper_status(state: &str) -> OperStatus {
    match state {
        "UP" => OperStatus::Up,
        "DOWN" | "LOWERLAYERDOWN" => OperStatus::Down,
        "DORMANT" => OperStatus::Dormant,
        "NOTPRESENT" => OperStatus::NotPresent,
        _ => OperStatus::Unknown,
    }
}

fn parse_adapters(json: &str) -> Result<Vec<Adapter>, StackError> {
    let links: Vec<IpLink> =
        serde_json::from_str(json).map_err(|e| StackError::os("parse ip output", e.to_string()))?;
    Ok(links
        .into_iter()
        .map(|link| Adapter {
            id: InterfaceId::new(link.ifindex, link.ifname),
            oper_status: parse_oper_status(&link.operstate),
            addresses: link
                .addr_info
                .into_iter()
                .filter_map(|a| IpNet::new(a.local, a.prefixlen).ok())
                .collect(),
        })
        .collect())
}

/// [`NetworkStack`] over iproute2, resolvectl and procfs
pub struct LinuxStack {
    proc_sys: PathBuf,
    /// Requested metrics, reported back by `ip_interface`
    metrics: Mutex<HashMap<(u32, AddressFamily), (bool, u32)>>,
}

impl LinuxStack {
    pub fn new() -> Self {
        Self {
            proc_sys: PathBuf::from("/proc/sys/net"),
            metrics: Mutex::new(HashMap::new()),
        }
    }

    fn conf_dir(&self, iface: &InterfaceId, family: AddressFamily) -> PathBuf {
        let family_dir = match family {
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        };
        self.proc_sys.join(family_dir).join("conf").join(&iface.name)
    }

    fn read_sys(&self, path: PathBuf) -> Result<u32, StackError> {
        let raw = fs::read_to_string(&path)
            .map_err(|_| StackError::NotFound(path.display().to_string()))?;
        raw.trim()
            .parse()
            .map_err(|e| StackError::os("read sysctl", format!("{}: {}", path.display(), e)))
    }

    fn write_sys(&self, path: PathBuf, value: u32) -> Result<(), StackError> {
        fs::write(&path, value.to_string())
            .map_err(|e| StackError::os("write sysctl", format!("{}: {}", path.display(), e)))
    }

    fn link_mtu(&self, iface: &InterfaceId) -> Result<u32, StackError> {
        self.read_sys(PathBuf::from("/sys/class/net").join(&iface.name).join("mtu"))
    }
}

impl Default for LinuxStack {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStack for LinuxStack {
    fn set_addresses(&self, iface: &InterfaceId, addresses: &[IpNet]) -> Result<(), StackError> {
        run("ip", &["addr", "flush", "dev", &iface.name])
            .map_err(|e| e.into_stack("flush addresses", format!("interface {}", iface)))?;
        for address in addresses {
            let cidr = address.to_string();
            run("ip", &["addr", "add", &cidr, "dev", &iface.name])
                .map_err(|e| e.into_stack("add address", format!("address {}", address)))?;
        }
        Ok(())
    }

    fn delete_address(&self, iface: &InterfaceId, address: &IpNet) -> Result<(), StackError> {
        let cidr = address.to_string();
        run("ip", &["addr", "del", &cidr, "dev", &iface.name])
            .map_err(|e| e.into_stack("delete address", format!("address {}", address)))?;
        Ok(())
    }

    fn flush_addresses(&self, iface: &InterfaceId, family: AddressFamily) -> Result<(), StackError> {
        run("ip", &[family_flag(family), "addr", "flush", "dev", &iface.name])
            .map_err(|e| e.into_stack("flush addresses", format!("interface {}", iface)))?;
        Ok(())
    }

    fn set_routes(&self, iface: &InterfaceId, routes: &[Route]) -> Result<(), StackError> {
        // TUN is point-to-point; the device alone selects the next hop
        for route in routes {
            let metric = route.metric.to_string();
            for destination in route_destinations(&route.destination) {
                let destination = destination.to_string();
                let added = run(
                    "ip",
                    &["route", "add", &destination, "dev", &iface.name, "metric", &metric],
                );
                match added {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {
                        debug!("Route {} already on {}", destination, iface);
                    }
                    Err(e) => return Err(e.into_stack("add route", format!("route {}", route))),
                }
            }
        }
        Ok(())
    }

    fn flush_routes(&self, iface: &InterfaceId, family: AddressFamily) -> Result<(), StackError> {
        run("ip", &[family_flag(family), "route", "flush", "dev", &iface.name])
            .map_err(|e| e.into_stack("flush routes", format!("interface {}", iface)))?;
        Ok(())
    }

    fn ip_interface(
        &self,
        iface: &InterfaceId,
        family: AddressFamily,
    ) -> Result<IpInterface, StackError> {
        let conf = self.conf_dir(iface, family);
        if !conf.is_dir() {
            return Err(StackError::NotFound(format!("{} binding of {}", family, iface)));
        }
        let mut params = IpInterface::new(family);
        params.mtu = match family {
            AddressFamily::Ipv4 => self.link_mtu(iface)?,
            AddressFamily::Ipv6 => self.read_sys(conf.join("mtu"))?,
        };
        if family == AddressFamily::Ipv6 {
            params.dad_transmits = self.read_sys(conf.join("dad_transmits"))?;
            params.router_discovery = self.read_sys(conf.join("accept_ra"))? != 0;
        }
        if let Some((automatic, metric)) = self.metrics.lock().unwrap().get(&(iface.index, family)) {
            params.use_automatic_metric = *automatic;
            params.metric = *metric;
        }
        Ok(params)
    }

    fn set_ip_interface(&self, iface: &InterfaceId, params: &IpInterface) -> Result<(), StackError> {
        let conf = self.conf_dir(iface, params.family);
        match params.family {
            AddressFamily::Ipv4 => {
                let mtu = params.mtu.to_string();
                run("ip", &["link", "set", "dev", &iface.name, "mtu", &mtu])
                    .map_err(|e| e.into_stack("set mtu", format!("interface {}", iface)))?;
            }
            AddressFamily::Ipv6 => {
                self.write_sys(conf.join("mtu"), params.mtu)?;
                self.write_sys(conf.join("dad_transmits"), params.dad_transmits)?;
                self.write_sys(conf.join("accept_ra"), u32::from(params.router_discovery))?;
            }
        }
        self.metrics.lock().unwrap().insert(
            (iface.index, params.family),
            (params.use_automatic_metric, params.metric),
        );
        Ok(())
    }

    fn set_dns(&self, iface: &InterfaceId, servers: &[IpAddr]) -> Result<(), StackError> {
        if servers.is_empty() {
            return self.flush_dns(iface);
        }
        let servers: Vec<String> = servers.iter().map(|s| s.to_string()).collect();
        let mut args = vec!["dns", iface.name.as_str()];
        args.extend(servers.iter().map(String::as_str));
        run("resolvectl", &args)
            .map_err(|e| e.into_stack("set dns", format!("interface {}", iface)))?;
        // Route every lookup through this link
        run("resolvectl", &["domain", &iface.name, "~."])
            .map_err(|e| e.into_stack("set dns domain", format!("interface {}", iface)))?;
        Ok(())
    }

    fn flush_dns(&self, iface: &InterfaceId) -> Result<(), StackError> {
        run("resolvectl", &["revert", &iface.name])
            .map_err(|e| e.into_stack("revert dns", format!("interface {}", iface)))?;
        Ok(())
    }

    fn adapters(&self) -> Result<Vec<Adapter>, StackError> {
        let json = run("ip", &["-j", "addr", "show"])
            .map_err(|e| StackError::os("list interfaces", e.message()))?;
        parse_adapters(&json)
    }
}

/// TUN device created with `ip tuntap`
pub struct TuntapDevice {
    iface: InterfaceId,
}

impl TunnelDevice for TuntapDevice {
    fn interface(&self) -> &InterfaceId {
        &self.iface
    }

    fn force_mtu(&mut self, mtu: u32) -> Result<(), DeviceError> {
        let mtu = mtu.to_string();
        run("ip", &["link", "set", "dev", &self.iface.name, "mtu", &mtu])
            .map_err(|e| DeviceError::Backend(e.message().to_string()))?;
        Ok(())
    }
}

/// [`DeviceProvider`] for kernel TUN devices
#[derive(Debug, Default)]
pub struct TuntapDevices;

impl TuntapDevices {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceProvider for TuntapDevices {
    fn create(&self, name: &TunnelName) -> Result<Box<dyn TunnelDevice>, DeviceError> {
        let dev = name.as_str();
        run("ip", &["tuntap", "add", "dev", dev, "mode", "tun"]).map_err(|e| {
            if e.is_already_exists() || e.message().contains("Device or resource busy") {
                DeviceError::AlreadyExists(dev.to_string())
            } else {
                DeviceError::Backend(e.message().to_string())
            }
        })?;
        run("ip", &["link", "set", "dev", dev, "up"])
            .map_err(|e| DeviceError::Backend(e.message().to_string()))?;

        let index_path = PathBuf::from("/sys/class/net").join(dev).join("ifindex");
        let index = fs::read_to_string(&index_path)
            .map_err(|e| DeviceError::Backend(format!("{}: {}", index_path.display(), e)))?
            .trim()
            .parse()
            .map_err(|e| DeviceError::Backend(format!("{}: {}", index_path.display(), e)))?;

        let iface = InterfaceId::new(index, dev);
        info!("Created TUN device {}", iface);
        Ok(Box::new(TuntapDevice { iface }))
    }

    fn destroy(&self, device: Box<dyn TunnelDevice>) -> Result<(), DeviceError> {
        let iface = device.interface().clone();
        run("ip", &["link", "del", "dev", &iface.name]).map_err(|e| {
            if e.is_not_found() {
                DeviceError::NotFound(iface.to_string())
            } else {
                DeviceError::Backend(e.message().to_string())
            }
        })?;
        info!("Destroyed TUN device {}", iface);
        Ok(())
    }
}

/// [`Firewall`] owning one nftables table
#[derive(Debug, Default)]
pub struct NftFirewall {
    current: Mutex<Option<InterfaceId>>,
}

impl NftFirewall {
    pub fn new() -> Self {
        Self::default()
    }
}

/// nftables script for a posture
fn nft_ruleset(iface: &InterfaceId, posture: &FirewallPosture) -> String {
    let mut rules = vec![
        "oifname \"lo\" accept".to_string(),
        format!("oifname \"{}\" accept", iface.name),
    ];
    if posture.restrict_all {
        for server in &posture.dns {
            let proto = match server {
                IpAddr::V4(_) => "ip",
                IpAddr::V6(_) => "ip6",
            };
            rules.push(format!(
                "{} daddr {} oifname != \"{}\" meta l4proto {{ tcp, udp }} th dport 53 drop",
                proto, server, iface.name
            ));
        }
        rules.push("meta l4proto { tcp, udp } th dport 53 drop".to_string());
    }

    let mut script = format!("table inet {} {{\n", NFT_TABLE);
    script.push_str("  chain output {\n");
    script.push_str("    type filter hook output priority 0; policy accept;\n");
    for rule in rules {
        script.push_str("    ");
        script.push_str(&rule);
        script.push('\n');
    }
    script.push_str("  }\n}\n");
    script
}

impl Firewall for NftFirewall {
    fn enable(&self, iface: &InterfaceId, posture: &FirewallPosture) -> Result<(), FirewallError> {
        let mut current = self.current.lock().unwrap();
        if let Some(other) = current.as_ref().filter(|other| *other != iface) {
            return Err(FirewallError::AlreadyEnabled(other.to_string()));
        }

        // Replace atomically: delete and recreate in a single transaction
        let script = format!(
            "table inet {table}\ndelete table inet {table}\n{rules}",
            table = NFT_TABLE,
            rules = nft_ruleset(iface, posture)
        );
        run_with_input("nft", &["-f", "-"], Some(&script))
            .map_err(|e| FirewallError::Backend(e.message().to_string()))?;

        info!(
            "Firewall enabled on {} (restrict all: {}, {} DNS servers)",
            iface,
            posture.restrict_all,
            posture.dns.len()
        );
        *current = Some(iface.clone());
        Ok(())
    }

    fn disable(&self, iface: &InterfaceId) -> Result<(), FirewallError> {
        let mut current = self.current.lock().unwrap();
        match run("nft", &["delete", "table", "inet", NFT_TABLE]) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!("Firewall table for {} was already gone", iface);
            }
            Err(e) => return Err(FirewallError::Backend(e.message().to_string())),
        }
        *current = None;
        debug!("Firewall disabled for {}", iface);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adapters() {
        let json = r#"[
            {"ifindex":1,"ifname":"lo","operstate":"UNKNOWN",
             "addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
            {"ifindex":7,"ifname":"office","operstate":"DOWN",
             "addr_info":[{"family":"inet","local":"10.0.0.2","prefixlen":24},
                          {"family":"inet6","local":"fd00::2","prefixlen":64}]}
        ]"#;

        let adapters = parse_adapters(json).unwrap();
        assert_eq!(adapters.len(), 2);
        assert_eq!(adapters[1].id, InterfaceId::new(7, "office"));
        assert_eq!(adapters[1].oper_status, OperStatus::Down);
        assert_eq!(
            adapters[1].addresses,
            vec![
                "10.0.0.2/24".parse::<IpNet>().unwrap(),
                "fd00::2/64".parse::<IpNet>().unwrap()
            ]
        );
        assert_eq!(adapters[0].oper_status, OperStatus::Unknown);
    }

    #[test]
    fn test_default_route_installed_as_halves() {
        let v4: IpNet = "0.0.0.0/0".parse().unwrap();
        let v6: IpNet = "::/0".parse().unwrap();
        let narrow: IpNet = "10.0.0.0/24".parse().unwrap();

        let halves: Vec<IpNet> = vec!["0.0.0.0/1".parse().unwrap(), "128.0.0.0/1".parse().unwrap()];
        assert_eq!(route_destinations(&v4), halves);
        let halves: Vec<IpNet> = vec!["::/1".parse().unwrap(), "8000::/1".parse().unwrap()];
        assert_eq!(route_destinations(&v6), halves);
        assert_eq!(route_destinations(&narrow), vec![narrow]);
    }

    #[test]
    fn test_command_error_classification() {
        let exists = CommandError::Failed("RTNETLINK answers: File exists".into());
        assert!(exists.is_already_exists());
        assert!(matches!(
            exists.into_stack("add", "address".into()),
            StackError::AlreadyExists(_)
        ));

        let missing = CommandError::Failed("Cannot find device \"tw0\"".into());
        assert!(matches!(
            missing.into_stack("add", "interface".into()),
            StackError::NotFound(_)
        ));

        let other = CommandError::Spawn("ip: permission denied".into());
        assert!(matches!(other.into_stack("add", "x".into()), StackError::Os { .. }));
    }

    #[test]
    fn test_ruleset_restrict_all_blocks_dns_leaks() {
        let iface = InterfaceId::new(9, "office");
        let posture = FirewallPosture {
            restrict_all: true,
            dns: vec!["10.0.0.1".parse().unwrap()],
        };

        let script = nft_ruleset(&iface, &posture);
        assert!(script.starts_with("table inet tunwarden {"));
        assert!(script.contains("oifname \"office\" accept"));
        assert!(script.contains("ip daddr 10.0.0.1 oifname != \"office\""));
        assert!(script.contains("th dport 53 drop"));
    }

    #[test]
    fn test_ruleset_without_restrict_all_only_accepts() {
        let iface = InterfaceId::new(9, "office");
        let script = nft_ruleset(&iface, &FirewallPosture::default());
        assert!(!script.contains("drop"));
    }
}
