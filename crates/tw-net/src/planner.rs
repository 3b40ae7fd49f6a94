//! Route/Address Planner
//!
//! Pure computation from a tunnel configuration to the network state that
//! should exist for it: addresses, a deduplicated route set, per-family
//! metric/MTU directives, DNS and the firewall posture.
//!
//! # Gateways
//!
//! Each interface address contributes a subnet route whose next hop is the
//! address masked by its own prefix. The first IPv4 and the first IPv6
//! such network address become that family's gateway; peer allowed-IPs of
//! a family with no gateway are skipped because there is nothing to route
//! them through.

use crate::config::{InterfaceConfig, PeerConfig, TunnelConfig};
use crate::firewall::FirewallPosture;
use crate::stack::{AddressFamily, IpInterface, Route};
use ipnet::IpNet;
use std::cmp::Ordering;
use std::net::IpAddr;

/// Metric given to a family that carries a default route
pub const MIN_METRIC: u32 = 0;

/// Deduplicated, sorted list of routes
///
/// No two entries share (metric, next hop, destination, mask).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    routes: Vec<Route>,
}

impl RouteSet {
    /// Sort and collapse duplicate routes
    pub fn from_routes(mut routes: Vec<Route>) -> Self {
        routes.sort_by(compare_routes);
        routes.dedup_by(|a, b| compare_routes(a, b) == Ordering::Equal);
        Self { routes }
    }

    pub fn as_slice(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn contains(&self, destination: &IpNet, next_hop: &IpAddr) -> bool {
        self.routes
            .iter()
            .any(|r| &r.destination == destination && &r.next_hop == next_hop)
    }
}

/// Ordering used for dedup: metric, next hop, destination address, mask.
fn compare_routes(a: &Route, b: &Route) -> Ordering {
    a.metric
        .cmp(&b.metric)
        .then_with(|| octets(&a.next_hop).cmp(&octets(&b.next_hop)))
        .then_with(|| octets(&a.destination.addr()).cmp(&octets(&b.destination.addr())))
        .then_with(|| octets(&a.destination.netmask()).cmp(&octets(&b.destination.netmask())))
}

fn octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Conditions worth reporting that do not stop the apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanWarning {
    /// Full-tunnel posture with no DNS server to reach through the tunnel
    RestrictAllWithoutDns,
}

/// Everything the reconciler applies for one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePlan {
    /// Interface addresses, in configuration order
    pub addresses: Vec<IpNet>,
    /// Routes to install
    pub routes: RouteSet,
    /// First IPv4 gateway seen
    pub gateway_v4: Option<IpAddr>,
    /// First IPv6 gateway seen
    pub gateway_v6: Option<IpAddr>,
    /// A peer routes the whole IPv4 space
    pub default_v4: bool,
    /// A peer routes the whole IPv6 space
    pub default_v6: bool,
    /// DNS servers
    pub dns: Vec<IpAddr>,
    /// MTU override
    pub mtu: Option<u32>,
    /// Firewall decision
    pub firewall: FirewallPosture,
    /// Non-fatal findings
    pub warnings: Vec<PlanWarning>,
}

impl InterfacePlan {
    /// Gateway recorded for a family
    pub fn gateway(&self, family: AddressFamily) -> Option<IpAddr> {
        match family {
            AddressFamily::Ipv4 => self.gateway_v4,
            AddressFamily::Ipv6 => self.gateway_v6,
        }
    }

    /// Whether a peer claimed the family's whole address space
    pub fn has_default_route(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::Ipv4 => self.default_v4,
            AddressFamily::Ipv6 => self.default_v6,
        }
    }

    /// Rewrite per-family interface parameters to match the plan
    ///
    /// A family carrying a default route gets automatic metric disabled and
    /// the minimum metric, so the tunnel wins route selection. IPv6 also has
    /// duplicate address detection and router discovery switched off.
    pub fn apply_params(&self, params: &mut IpInterface) {
        if self.has_default_route(params.family) {
            params.use_automatic_metric = false;
            params.metric = MIN_METRIC;
        }
        if let Some(mtu) = self.mtu {
            params.mtu = mtu;
        }
        if params.family == AddressFamily::Ipv6 {
            params.dad_transmits = 0;
            params.router_discovery = false;
        }
    }
}

/// Plan a whole tunnel config
pub fn plan_tunnel(config: &TunnelConfig) -> InterfacePlan {
    plan(&config.interface, &config.peers)
}

/// Plan interface state from interface settings and peers
pub fn plan(interface: &InterfaceConfig, peers: &[PeerConfig]) -> InterfacePlan {
    let estimated = interface.addresses.len()
        + peers.iter().map(|p| p.allowed_ips.len()).sum::<usize>();
    let mut routes = Vec::with_capacity(estimated);
    let mut gateway_v4 = None;
    let mut gateway_v6 = None;

    for addr in &interface.addresses {
        let subnet = addr.trunc();
        let gateway = subnet.addr();
        match addr {
            IpNet::V4(_) if gateway_v4.is_none() => gateway_v4 = Some(gateway),
            IpNet::V6(_) if gateway_v6.is_none() => gateway_v6 = Some(gateway),
            _ => {}
        }
        routes.push(Route {
            destination: subnet,
            next_hop: gateway,
            metric: 0,
        });
    }

    let mut default_v4 = false;
    let mut default_v6 = false;
    for peer in peers {
        for allowed in &peer.allowed_ips {
            let next_hop = match allowed {
                IpNet::V4(_) => gateway_v4,
                IpNet::V6(_) => gateway_v6,
            };
            let Some(next_hop) = next_hop else {
                continue;
            };
            if allowed.prefix_len() == 0 {
                match allowed {
                    IpNet::V4(_) => default_v4 = true,
                    IpNet::V6(_) => default_v6 = true,
                }
            }
            routes.push(Route {
                destination: allowed.trunc(),
                next_hop,
                metric: 0,
            });
        }
    }

    let firewall = firewall_posture(interface, peers);
    let mut warnings = Vec::new();
    if firewall.restrict_all && firewall.dns.is_empty() {
        warnings.push(PlanWarning::RestrictAllWithoutDns);
    }

    InterfacePlan {
        addresses: interface.addresses.clone(),
        routes: RouteSet::from_routes(routes),
        gateway_v4,
        gateway_v6,
        default_v4,
        default_v6,
        dns: interface.dns.clone(),
        mtu: (interface.mtu > 0).then_some(u32::from(interface.mtu)),
        firewall,
        warnings,
    }
}

/// Decide the firewall posture
///
/// Restrict-all only for a full-tunnel setup: exactly one peer whose only
/// allowed-IP is the whole address space of its family.
pub fn firewall_posture(interface: &InterfaceConfig, peers: &[PeerConfig]) -> FirewallPosture {
    let restrict_all = match peers {
        [peer] => match peer.allowed_ips.as_slice() {
            [only] => is_whole_space(only),
            _ => false,
        },
        _ => false,
    };
    FirewallPosture {
        restrict_all,
        dns: interface.dns.clone(),
    }
}

fn is_whole_space(net: &IpNet) -> bool {
    net.prefix_len() == 0 && net.addr().is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn peer(seed: u8, allowed: &[&str]) -> PeerConfig {
        let mut p = PeerConfig::new(PrivateKey::from_bytes([seed; 32]).public_key());
        p.allowed_ips = allowed.iter().map(|s| net(s)).collect();
        p
    }

    fn iface(addresses: &[&str]) -> InterfaceConfig {
        InterfaceConfig {
            addresses: addresses.iter().map(|s| net(s)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_subnet_and_default_route_scenario() {
        let plan = plan(
            &iface(&["10.0.0.2/24"]),
            &[peer(1, &["10.0.0.0/24", "0.0.0.0/0"])],
        );

        assert_eq!(plan.routes.len(), 2);
        assert!(plan.routes.contains(&net("10.0.0.0/24"), &ip("10.0.0.0")));
        assert!(plan.routes.contains(&net("0.0.0.0/0"), &ip("10.0.0.0")));
        assert!(!plan.firewall.restrict_all);
        assert!(plan.default_v4);
        assert!(!plan.default_v6);
    }

    #[test]
    fn test_first_gateway_per_family_wins() {
        let plan = plan(
            &iface(&["10.0.0.2/24", "192.168.7.9/16", "fd00::2/64", "fd01::5/48"]),
            &[peer(1, &["172.16.0.0/12", "fd10::/32"])],
        );

        assert_eq!(plan.gateway_v4, Some(ip("10.0.0.0")));
        assert_eq!(plan.gateway_v6, Some(ip("fd00::")));
        assert!(plan.routes.contains(&net("172.16.0.0/12"), &ip("10.0.0.0")));
        assert!(plan.routes.contains(&net("fd10::/32"), &ip("fd00::")));
        assert!(plan.routes.contains(&net("192.168.0.0/16"), &ip("192.168.0.0")));
    }

    #[test]
    fn test_allowed_ip_without_gateway_is_skipped() {
        let plan = plan(&iface(&["10.0.0.2/24"]), &[peer(1, &["::/0", "10.1.0.0/16"])]);

        assert_eq!(plan.routes.len(), 2);
        assert!(!plan.default_v6);
        assert!(plan.routes.iter().all(|r| r.next_hop.is_ipv4()));
    }

    #[test]
    fn test_allowed_ip_host_bits_are_cleared() {
        let plan = plan(&iface(&["10.0.0.2/24"]), &[peer(1, &["10.9.9.9/16"])]);
        assert!(plan.routes.contains(&net("10.9.0.0/16"), &ip("10.0.0.0")));
    }

    #[test]
    fn test_restrict_all_single_full_tunnel_peer() {
        let interface = iface(&["10.0.0.2/24"]);
        assert!(firewall_posture(&interface, &[peer(1, &["0.0.0.0/0"])]).restrict_all);
        assert!(firewall_posture(&interface, &[peer(1, &["::/0"])]).restrict_all);
    }

    #[test]
    fn test_restrict_all_rejects_extra_allowed_ip() {
        let interface = iface(&["10.0.0.2/24"]);
        let posture = firewall_posture(&interface, &[peer(1, &["0.0.0.0/0", "10.0.0.0/24"])]);
        assert!(!posture.restrict_all);
    }

    #[test]
    fn test_restrict_all_rejects_two_peers() {
        let interface = iface(&["10.0.0.2/24"]);
        let posture = firewall_posture(
            &interface,
            &[peer(1, &["0.0.0.0/0"]), peer(2, &["0.0.0.0/0"])],
        );
        assert!(!posture.restrict_all);
    }

    #[test]
    fn test_restrict_all_requires_zero_network() {
        // ipnet keeps host bits, so a /0 with a non-zero address is not "everything"
        let interface = iface(&["10.0.0.2/24"]);
        let posture = firewall_posture(&interface, &[peer(1, &["1.2.3.4/0"])]);
        assert!(!posture.restrict_all);
    }

    #[test]
    fn test_restrict_all_without_dns_warns() {
        let plan = plan(&iface(&["10.0.0.2/24"]), &[peer(1, &["0.0.0.0/0"])]);
        assert!(plan.firewall.restrict_all);
        assert_eq!(plan.warnings, vec![PlanWarning::RestrictAllWithoutDns]);

        let mut with_dns = iface(&["10.0.0.2/24"]);
        with_dns.dns = vec![ip("10.0.0.1")];
        let plan = super::plan(&with_dns, &[peer(1, &["0.0.0.0/0"])]);
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.firewall.dns, vec![ip("10.0.0.1")]);
    }

    #[test]
    fn test_default_route_pins_metric() {
        let plan = plan(&iface(&["10.0.0.2/24"]), &[peer(1, &["0.0.0.0/0"])]);

        let mut v4 = IpInterface::new(AddressFamily::Ipv4);
        v4.metric = 25;
        plan.apply_params(&mut v4);
        assert!(!v4.use_automatic_metric);
        assert_eq!(v4.metric, MIN_METRIC);
    }

    #[test]
    fn test_no_default_route_keeps_automatic_metric() {
        let plan = plan(&iface(&["10.0.0.2/24"]), &[peer(1, &["10.0.0.0/8"])]);

        let mut v4 = IpInterface::new(AddressFamily::Ipv4);
        plan.apply_params(&mut v4);
        assert!(v4.use_automatic_metric);
    }

    #[test]
    fn test_ipv6_params_disable_discovery_and_set_mtu() {
        let mut interface = iface(&["fd00::2/64"]);
        interface.mtu = 1380;
        let plan = plan(&interface, &[]);

        let mut v6 = IpInterface::new(AddressFamily::Ipv6);
        plan.apply_params(&mut v6);
        assert_eq!(v6.mtu, 1380);
        assert_eq!(v6.dad_transmits, 0);
        assert!(!v6.router_discovery);
        assert!(v6.use_automatic_metric);
    }

    #[test]
    fn test_mtu_zero_means_unset() {
        let plan = plan(&iface(&["10.0.0.2/24"]), &[]);
        assert_eq!(plan.mtu, None);
    }

    fn arb_route() -> impl Strategy<Value = Route> {
        (0u32..3, 0u8..4, any::<u8>(), 0u8..=32, any::<bool>()).prop_map(
            |(metric, hop, dst, len, v6)| {
                if v6 {
                    let dst = Ipv6Addr::new(0xfd00, u16::from(dst), 0, 0, 0, 0, 0, 0);
                    Route {
                        destination: IpNet::new(IpAddr::V6(dst), len * 4).unwrap().trunc(),
                        next_hop: IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, u16::from(hop))),
                        metric,
                    }
                } else {
                    Route {
                        destination: IpNet::new(IpAddr::V4(Ipv4Addr::new(10, dst, 0, 0)), len)
                            .unwrap()
                            .trunc(),
                        next_hop: IpAddr::V4(Ipv4Addr::new(10, 0, 0, hop)),
                        metric,
                    }
                }
            },
        )
    }

    proptest! {
        #[test]
        fn test_route_set_has_no_duplicates(routes in proptest::collection::vec(arb_route(), 0..40)) {
            let set = RouteSet::from_routes(routes.clone());
            let slice = set.as_slice();
            for (i, a) in slice.iter().enumerate() {
                for b in &slice[i + 1..] {
                    prop_assert_ne!(compare_routes(a, b), Ordering::Equal);
                }
            }
            for route in &routes {
                prop_assert!(slice.contains(route));
            }
        }

        #[test]
        fn test_planning_is_deterministic(
            hosts in proptest::collection::vec((any::<u8>(), 8u8..=30), 1..4),
            allowed in proptest::collection::vec((any::<u8>(), 0u8..=24), 0..8),
        ) {
            let interface = InterfaceConfig {
                addresses: hosts
                    .iter()
                    .map(|(h, len)| IpNet::new(IpAddr::V4(Ipv4Addr::new(10, *h, 0, 2)), *len).unwrap())
                    .collect(),
                ..Default::default()
            };
            let mut p = peer(1, &[]);
            p.allowed_ips = allowed
                .iter()
                .map(|(n, len)| IpNet::new(IpAddr::V4(Ipv4Addr::new(*n, 0, 0, 0)), *len).unwrap())
                .collect();
            let peers = vec![p];

            let first = plan(&interface, &peers);
            let second = plan(&interface, &peers);
            prop_assert_eq!(&first.routes, &second.routes);

            let replanned = RouteSet::from_routes(first.routes.as_slice().to_vec());
            prop_assert_eq!(&replanned, &first.routes);
        }
    }
}
