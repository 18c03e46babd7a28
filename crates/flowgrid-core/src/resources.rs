//! Resource model — offers, requests, grants, and matching.
//!
//! Three shapes of resource are modeled:
//! - **Scalars** (cores, memory, disk): consumed by amount.
//! - **Ranges** (ports): consumed as concrete port numbers.
//! - **Named sets** (network interfaces, accelerators): matched by
//!   network or class, never split across devices.
//!
//! Matching is a pure function layer. [`NodeResources::subtract`] returns
//! the remainder and the grant without modifying its input, so the
//! allocator can try a node, back out, and try the next one.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::error::InfeasibleRequest;
use crate::types::{NodeId, OfferId};

/// Role carried by unreserved offers.
pub const ANY_ROLE: &str = "*";

/// Number of distinct port numbers a node can expose.
pub const MAX_PORTS: u32 = 65_536;

fn default_role() -> String {
    ANY_ROLE.to_string()
}

// ── Scalars ───────────────────────────────────────────────────────

/// Scalar quantities: cores (in millicores), memory and disk (in bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scalars {
    #[serde(default)]
    pub millicores: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub disk_bytes: u64,
}

impl Scalars {
    pub const ZERO: Self = Self::new(0, 0, 0);

    pub const fn new(millicores: u64, memory_bytes: u64, disk_bytes: u64) -> Self {
        Self {
            millicores,
            memory_bytes,
            disk_bytes,
        }
    }

    /// Whether `self` meets or exceeds `other` in every dimension.
    pub fn covers(&self, other: &Scalars) -> bool {
        self.millicores >= other.millicores
            && self.memory_bytes >= other.memory_bytes
            && self.disk_bytes >= other.disk_bytes
    }

    /// Component-wise subtraction, `None` if any dimension would underflow.
    pub fn checked_sub(&self, other: &Scalars) -> Option<Scalars> {
        Some(Scalars {
            millicores: self.millicores.checked_sub(other.millicores)?,
            memory_bytes: self.memory_bytes.checked_sub(other.memory_bytes)?,
            disk_bytes: self.disk_bytes.checked_sub(other.disk_bytes)?,
        })
    }

    pub fn saturating_sub(&self, other: &Scalars) -> Scalars {
        Scalars {
            millicores: self.millicores.saturating_sub(other.millicores),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
        }
    }

    /// Component-wise minimum.
    pub fn min(&self, other: &Scalars) -> Scalars {
        Scalars {
            millicores: self.millicores.min(other.millicores),
            memory_bytes: self.memory_bytes.min(other.memory_bytes),
            disk_bytes: self.disk_bytes.min(other.disk_bytes),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Add for Scalars {
    type Output = Scalars;

    fn add(self, rhs: Scalars) -> Scalars {
        Scalars {
            millicores: self.millicores.saturating_add(rhs.millicores),
            memory_bytes: self.memory_bytes.saturating_add(rhs.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_add(rhs.disk_bytes),
        }
    }
}

impl AddAssign for Scalars {
    fn add_assign(&mut self, rhs: Scalars) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for Scalars {
    fn sum<I: Iterator<Item = Scalars>>(iter: I) -> Self {
        iter.fold(Scalars::ZERO, Add::add)
    }
}

impl fmt::Display for Scalars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}m cpu, {} B mem, {} B disk",
            self.millicores, self.memory_bytes, self.disk_bytes
        )
    }
}

// ── Ports ─────────────────────────────────────────────────────────

/// An inclusive range of port numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Self {
        Self {
            begin: begin.min(end),
            end: begin.max(end),
        }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    /// Number of ports in the range (never zero).
    pub fn len(&self) -> u32 {
        u32::from(self.end) - u32::from(self.begin) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        self.begin <= port && port <= self.end
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.begin..=self.end
    }

    /// The first `n` ports of the range. `n` must be in `1..=len()`.
    fn prefix(&self, n: u32) -> PortRange {
        PortRange {
            begin: self.begin,
            end: self.begin + (n - 1) as u16,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.begin, self.end)
    }
}

/// Sort ranges and merge the overlapping or adjacent ones.
fn normalize_ranges(ranges: &mut Vec<PortRange>) {
    ranges.sort();
    let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if u32::from(range.begin) <= u32::from(last.end) + 1 => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    *ranges = merged;
}

/// Remove `taken` from `ranges`, splitting ranges where needed.
fn remove_range(ranges: &mut Vec<PortRange>, taken: PortRange) {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for range in ranges.drain(..) {
        if !range.overlaps(&taken) {
            out.push(range);
            continue;
        }
        if range.begin < taken.begin {
            out.push(PortRange::new(range.begin, taken.begin - 1));
        }
        if range.end > taken.end {
            out.push(PortRange::new(taken.end + 1, range.end));
        }
    }
    *ranges = out;
}

/// Pick `count` ports from `available` (sorted by first port).
///
/// Contiguous requests take the lowest run of consecutive ports; runs may
/// cross offer boundaries when the ranges are adjacent. Otherwise the
/// lowest free ports are taken.
fn take_ports(
    available: &[(usize, PortRange)],
    count: u32,
    contiguous: bool,
) -> Option<Vec<(usize, PortRange)>> {
    if count == 0 {
        return Some(Vec::new());
    }

    if !contiguous {
        let total: u32 = available.iter().map(|(_, r)| r.len()).sum();
        return (total >= count).then(|| take_prefix(available, count));
    }

    let mut run_start = 0;
    let mut run_len: u32 = 0;
    let mut prev_end: Option<u16> = None;
    for (i, (_, range)) in available.iter().enumerate() {
        let adjacent =
            matches!(prev_end, Some(end) if u32::from(end) + 1 == u32::from(range.begin));
        if !adjacent {
            run_start = i;
            run_len = 0;
        }
        run_len += range.len();
        prev_end = Some(range.end);
        if run_len >= count {
            return Some(take_prefix(&available[run_start..=i], count));
        }
    }
    None
}

fn take_prefix(ranges: &[(usize, PortRange)], count: u32) -> Vec<(usize, PortRange)> {
    let mut remaining = count;
    let mut taken = Vec::new();
    for (offer, range) in ranges {
        if remaining == 0 {
            break;
        }
        let n = remaining.min(range.len());
        taken.push((*offer, range.prefix(n)));
        remaining -= n;
    }
    taken
}

// ── Named resources ───────────────────────────────────────────────

/// A network interface on a node, attached to a logical network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceResource {
    /// Device name on the node (e.g. `"eth1"`).
    pub name: String,
    /// Logical network the device is attached to.
    pub network: String,
    /// Bandwidth still available on the device, bits per second.
    #[serde(default)]
    pub bandwidth_bps: u64,
}

/// A whole accelerator device (GPU, FPGA, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcceleratorResource {
    pub id: String,
    pub class: String,
}

/// A bundle of concrete resources: what an offer advertises, or the part
/// of it handed to one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    #[serde(default)]
    pub scalars: Scalars,
    #[serde(default)]
    pub ports: Vec<PortRange>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceResource>,
    #[serde(default)]
    pub accelerators: Vec<AcceleratorResource>,
}

impl ResourceSet {
    pub fn is_empty(&self) -> bool {
        self.scalars.is_zero()
            && self.ports.is_empty()
            && self.interfaces.is_empty()
            && self.accelerators.is_empty()
    }

    pub fn port_count(&self) -> u32 {
        self.ports.iter().map(PortRange::len).sum()
    }

    /// Add `other` into `self`. Interface bandwidth is summed per device.
    pub fn merge(&mut self, other: &ResourceSet) {
        self.scalars += other.scalars;
        self.ports.extend(other.ports.iter().copied());
        for iface in &other.interfaces {
            match self
                .interfaces
                .iter_mut()
                .find(|i| i.name == iface.name && i.network == iface.network)
            {
                Some(existing) => {
                    existing.bandwidth_bps = existing.bandwidth_bps.saturating_add(iface.bandwidth_bps);
                }
                None => self.interfaces.push(iface.clone()),
            }
        }
        for dev in &other.accelerators {
            if !self.accelerators.iter().any(|a| a.id == dev.id) {
                self.accelerators.push(dev.clone());
            }
        }
        self.normalize();
    }

    /// Canonical ordering so that matching is deterministic.
    pub fn normalize(&mut self) {
        normalize_ranges(&mut self.ports);
        self.interfaces
            .sort_by(|a, b| (&a.name, &a.network).cmp(&(&b.name, &b.network)));
        self.accelerators.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

// ── Offers ────────────────────────────────────────────────────────

/// A cluster framework's advertisement of free resources on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub node: NodeId,
    #[serde(default = "default_role")]
    pub role: String,
    /// Epoch milliseconds after which the offer may no longer be used.
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(flatten)]
    pub resources: ResourceSet,
}

impl Offer {
    pub fn new(id: impl Into<OfferId>, node: impl Into<NodeId>, resources: ResourceSet) -> Self {
        let mut resources = resources;
        resources.normalize();
        Self {
            id: id.into(),
            node: node.into(),
            role: default_role(),
            expires_at: None,
            resources,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_expiry(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

/// The part of one offer consumed by one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferFragment {
    pub offer_id: OfferId,
    pub role: String,
    #[serde(flatten)]
    pub resources: ResourceSet,
}

/// Everything a task was given: one node, fragments of one or more offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub node: NodeId,
    pub fragments: Vec<OfferFragment>,
}

impl Grant {
    pub fn offer_ids(&self) -> Vec<OfferId> {
        self.fragments.iter().map(|f| f.offer_id.clone()).collect()
    }

    pub fn scalars(&self) -> Scalars {
        self.fragments.iter().map(|f| f.resources.scalars).sum()
    }

    /// Concrete port numbers, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .fragments
            .iter()
            .flat_map(|f| f.resources.ports.iter().flat_map(PortRange::ports))
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn interfaces(&self) -> Vec<&InterfaceResource> {
        self.fragments
            .iter()
            .flat_map(|f| f.resources.interfaces.iter())
            .collect()
    }

    pub fn accelerator_ids(&self) -> Vec<&str> {
        self.fragments
            .iter()
            .flat_map(|f| f.resources.accelerators.iter().map(|a| a.id.as_str()))
            .collect()
    }

    /// Whether two grants share no exclusive resource instance (port or
    /// accelerator). Grants on different nodes are always disjoint.
    pub fn is_disjoint_from(&self, other: &Grant) -> bool {
        if self.node != other.node {
            return true;
        }
        let ports = other.ports();
        if self.ports().iter().any(|p| ports.binary_search(p).is_ok()) {
            return false;
        }
        let devices = other.accelerator_ids();
        !self.accelerator_ids().iter().any(|d| devices.contains(d))
    }
}

// ── Requests ──────────────────────────────────────────────────────

/// A task's need for an interface on a logical network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceRequest {
    pub network: String,
    #[serde(default)]
    pub bandwidth_bps: Option<u64>,
}

/// A task's need for whole accelerator devices of one class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcceleratorRequest {
    pub class: String,
    pub count: u32,
}

/// What a task needs from a node. Immutable once attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub scalars: Scalars,
    #[serde(default)]
    pub ports: u32,
    #[serde(default)]
    pub contiguous_ports: bool,
    #[serde(default)]
    pub interfaces: Vec<InterfaceRequest>,
    #[serde(default)]
    pub accelerators: Vec<AcceleratorRequest>,
    /// Only offers carrying this role may be used. `None` accepts any role.
    #[serde(default)]
    pub role: Option<String>,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cores(mut self, millicores: u64) -> Self {
        self.scalars.millicores = millicores;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.scalars.memory_bytes = bytes;
        self
    }

    pub fn with_disk(mut self, bytes: u64) -> Self {
        self.scalars.disk_bytes = bytes;
        self
    }

    pub fn with_ports(mut self, count: u32) -> Self {
        self.ports = count;
        self
    }

    pub fn with_contiguous_ports(mut self, count: u32) -> Self {
        self.ports = count;
        self.contiguous_ports = true;
        self
    }

    pub fn with_interface(mut self, network: impl Into<String>, bandwidth_bps: Option<u64>) -> Self {
        self.interfaces.push(InterfaceRequest {
            network: network.into(),
            bandwidth_bps,
        });
        self
    }

    pub fn with_accelerators(mut self, class: impl Into<String>, count: u32) -> Self {
        self.accelerators.push(AcceleratorRequest {
            class: class.into(),
            count,
        });
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Reject requests that no conceivable offer could ever satisfy.
    ///
    /// A request that merely exceeds every node in today's cluster is not
    /// rejected here; the cluster may grow.
    pub fn validate(&self) -> Result<(), InfeasibleRequest> {
        if self.ports > MAX_PORTS {
            return Err(InfeasibleRequest::TooManyPorts {
                requested: self.ports,
            });
        }
        for (i, iface) in self.interfaces.iter().enumerate() {
            if iface.network.trim().is_empty() {
                return Err(InfeasibleRequest::EmptyNetwork);
            }
            if self.interfaces[..i].iter().any(|prev| prev.network == iface.network) {
                return Err(InfeasibleRequest::DuplicateNetwork {
                    network: iface.network.clone(),
                });
            }
        }
        for acc in &self.accelerators {
            if acc.class.trim().is_empty() {
                return Err(InfeasibleRequest::EmptyAcceleratorClass);
            }
            if acc.count == 0 {
                return Err(InfeasibleRequest::ZeroAccelerators {
                    class: acc.class.clone(),
                });
            }
        }
        if matches!(&self.role, Some(role) if role.trim().is_empty()) {
            return Err(InfeasibleRequest::EmptyRole);
        }
        Ok(())
    }

    /// Combined request of a co-location class.
    ///
    /// The result is a necessary condition: a node that cannot satisfy it
    /// cannot hold the whole class. Interfaces are reduced to one
    /// bandwidth-free requirement per network, since members may share a
    /// device; accelerators are exclusive so their counts add up.
    pub fn combine<'a>(requests: impl IntoIterator<Item = &'a ResourceRequest>) -> ResourceRequest {
        let mut combined = ResourceRequest::default();
        let mut accelerators: BTreeMap<String, u32> = BTreeMap::new();
        let mut roles: Vec<Option<String>> = Vec::new();

        for req in requests {
            combined.scalars += req.scalars;
            combined.ports = combined.ports.saturating_add(req.ports);
            for iface in &req.interfaces {
                if !combined.interfaces.iter().any(|i| i.network == iface.network) {
                    combined.interfaces.push(InterfaceRequest {
                        network: iface.network.clone(),
                        bandwidth_bps: None,
                    });
                }
            }
            for acc in &req.accelerators {
                *accelerators.entry(acc.class.clone()).or_default() += acc.count;
            }
            if !roles.contains(&req.role) {
                roles.push(req.role.clone());
            }
        }

        combined.accelerators = accelerators
            .into_iter()
            .map(|(class, count)| AcceleratorRequest { class, count })
            .collect();
        combined.role = match roles.as_slice() {
            [single] => single.clone(),
            _ => None,
        };
        combined
    }
}

// ── Matching ──────────────────────────────────────────────────────

/// Why a request does not fit a node right now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Infeasible {
    #[error("insufficient scalar resources: need {needed}, have {available}")]
    Scalars { needed: Scalars, available: Scalars },

    #[error("cannot supply {requested} ports (contiguous: {contiguous})")]
    Ports { requested: u32, contiguous: bool },

    #[error("no interface on network {network} with {bandwidth_bps} bps free")]
    Interface { network: String, bandwidth_bps: u64 },

    #[error("need {requested} accelerators of class {class}, found {available}")]
    Accelerators {
        class: String,
        requested: u32,
        available: u32,
    },
}

/// Result of a successful [`NodeResources::subtract`].
#[derive(Debug, Clone, PartialEq)]
pub struct Subtraction {
    pub remainder: NodeResources,
    pub grant: Grant,
}

fn role_matches(wanted: Option<&str>, offered: &str) -> bool {
    match wanted {
        None => true,
        Some(role) => role == offered,
    }
}

/// All resources currently available on one node, accumulated from one or
/// more offers. Offers are kept sorted by id.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResources {
    node: NodeId,
    offers: Vec<Offer>,
}

impl NodeResources {
    pub fn new(node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            offers: Vec::new(),
        }
    }

    pub fn from_offers(node: impl Into<NodeId>, offers: impl IntoIterator<Item = Offer>) -> Self {
        let mut resources = Self::new(node);
        for offer in offers {
            resources.add_offer(offer);
        }
        resources
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn offers(&self) -> &[Offer] {
        &self.offers
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// Add an offer, replacing any previous offer with the same id.
    pub fn add_offer(&mut self, mut offer: Offer) {
        offer.resources.normalize();
        match self.offers.binary_search_by(|o| o.id.cmp(&offer.id)) {
            Ok(pos) => self.offers[pos] = offer,
            Err(pos) => self.offers.insert(pos, offer),
        }
    }

    pub fn remove_offer(&mut self, id: &str) -> Option<Offer> {
        let pos = self.offers.iter().position(|o| o.id == id)?;
        Some(self.offers.remove(pos))
    }

    /// Remove and return every offer expired at `now_ms`.
    pub fn drop_expired(&mut self, now_ms: u64) -> Vec<Offer> {
        let (expired, live): (Vec<Offer>, Vec<Offer>) = std::mem::take(&mut self.offers)
            .into_iter()
            .partition(|o| o.is_expired(now_ms));
        self.offers = live;
        expired
    }

    /// Total scalar capacity across all offers on this node.
    pub fn scalars(&self) -> Scalars {
        self.offers.iter().map(|o| o.resources.scalars).sum()
    }

    pub fn can_satisfy(&self, request: &ResourceRequest) -> bool {
        self.subtract(request).is_ok()
    }

    /// Carve `request` out of this node's offers.
    ///
    /// Scalars are drawn from offers in id order. Ports, interfaces and
    /// accelerators are chosen lowest-first. Only offers whose role matches
    /// the request are considered.
    pub fn subtract(&self, request: &ResourceRequest) -> Result<Subtraction, Infeasible> {
        let mut remainder = self.clone();
        let mut taken: BTreeMap<usize, ResourceSet> = BTreeMap::new();
        let eligible: Vec<usize> = (0..remainder.offers.len())
            .filter(|&i| role_matches(request.role.as_deref(), &remainder.offers[i].role))
            .collect();

        // Scalars.
        let available: Scalars = eligible
            .iter()
            .map(|&i| remainder.offers[i].resources.scalars)
            .sum();
        if !available.covers(&request.scalars) {
            return Err(Infeasible::Scalars {
                needed: request.scalars,
                available,
            });
        }
        let mut need = request.scalars;
        for &i in &eligible {
            if need.is_zero() {
                break;
            }
            let offered = &mut remainder.offers[i].resources.scalars;
            let take = offered.min(&need);
            if take.is_zero() {
                continue;
            }
            *offered = offered.saturating_sub(&take);
            need = need.saturating_sub(&take);
            taken.entry(i).or_default().scalars += take;
        }

        // Ports.
        if request.ports > 0 {
            let mut candidates: Vec<(usize, PortRange)> = eligible
                .iter()
                .flat_map(|&i| remainder.offers[i].resources.ports.iter().map(move |r| (i, *r)))
                .collect();
            candidates.sort_by_key(|(i, r)| (r.begin, *i));
            let picked = take_ports(&candidates, request.ports, request.contiguous_ports).ok_or(
                Infeasible::Ports {
                    requested: request.ports,
                    contiguous: request.contiguous_ports,
                },
            )?;
            for (i, range) in picked {
                remove_range(&mut remainder.offers[i].resources.ports, range);
                taken.entry(i).or_default().ports.push(range);
            }
        }

        // Interfaces: one device per requirement, never the same device twice.
        let mut used_devices: Vec<String> = Vec::new();
        for want in &request.interfaces {
            let bandwidth = want.bandwidth_bps.unwrap_or(0);
            let found = eligible.iter().find_map(|&i| {
                remainder.offers[i]
                    .resources
                    .interfaces
                    .iter()
                    .position(|iface| {
                        iface.network == want.network
                            && iface.bandwidth_bps >= bandwidth
                            && !used_devices.contains(&iface.name)
                    })
                    .map(|j| (i, j))
            });
            let Some((i, j)) = found else {
                return Err(Infeasible::Interface {
                    network: want.network.clone(),
                    bandwidth_bps: bandwidth,
                });
            };
            let iface = &mut remainder.offers[i].resources.interfaces[j];
            iface.bandwidth_bps -= bandwidth;
            used_devices.push(iface.name.clone());
            let granted = InterfaceResource {
                name: iface.name.clone(),
                network: iface.network.clone(),
                bandwidth_bps: bandwidth,
            };
            taken.entry(i).or_default().interfaces.push(granted);
        }

        // Accelerators: whole devices, matched by class.
        for want in &request.accelerators {
            let mut picked: Vec<(usize, usize)> = Vec::new();
            'offers: for &i in &eligible {
                for (j, dev) in remainder.offers[i].resources.accelerators.iter().enumerate() {
                    if picked.len() as u32 == want.count {
                        break 'offers;
                    }
                    if dev.class == want.class {
                        picked.push((i, j));
                    }
                }
            }
            if (picked.len() as u32) < want.count {
                return Err(Infeasible::Accelerators {
                    class: want.class.clone(),
                    requested: want.count,
                    available: picked.len() as u32,
                });
            }
            for &(i, j) in picked.iter().rev() {
                let dev = remainder.offers[i].resources.accelerators.remove(j);
                taken.entry(i).or_default().accelerators.push(dev);
            }
        }

        let fragments = taken
            .into_iter()
            .map(|(i, mut resources)| {
                resources.normalize();
                OfferFragment {
                    offer_id: self.offers[i].id.clone(),
                    role: self.offers[i].role.clone(),
                    resources,
                }
            })
            .collect();

        Ok(Subtraction {
            remainder,
            grant: Grant {
                node: self.node.clone(),
                fragments,
            },
        })
    }

    /// Give a fragment back to its source offer.
    ///
    /// Returns false when the offer is no longer held (expired, rescinded,
    /// or declined), in which case the resources are simply dropped.
    pub fn restore(&mut self, fragment: &OfferFragment) -> bool {
        match self.offers.iter_mut().find(|o| o.id == fragment.offer_id) {
            Some(offer) => {
                offer.resources.merge(&fragment.resources);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn scalar_offer(id: &str, node: &str, millicores: u64, memory: u64) -> Offer {
        Offer::new(
            id,
            node,
            ResourceSet {
                scalars: Scalars::new(millicores, memory, 0),
                ..Default::default()
            },
        )
    }

    fn port_offer(id: &str, node: &str, ranges: &[(u16, u16)]) -> Offer {
        Offer::new(
            id,
            node,
            ResourceSet {
                ports: ranges.iter().map(|&(b, e)| PortRange::new(b, e)).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn scalars_must_meet_minimum() {
        let node = NodeResources::from_offers("n1", [scalar_offer("o1", "n1", 4000, 8 * GIB)]);

        assert!(node.can_satisfy(&ResourceRequest::new().with_cores(4000).with_memory(8 * GIB)));
        assert!(!node.can_satisfy(&ResourceRequest::new().with_cores(4001)));
    }

    #[test]
    fn subtract_is_pure_and_returns_remainder() {
        let node = NodeResources::from_offers("n1", [scalar_offer("o1", "n1", 4000, 8 * GIB)]);
        let req = ResourceRequest::new().with_cores(1500).with_memory(GIB);

        let sub = node.subtract(&req).unwrap();

        assert_eq!(node.scalars(), Scalars::new(4000, 8 * GIB, 0));
        assert_eq!(sub.remainder.scalars(), Scalars::new(2500, 7 * GIB, 0));
        assert_eq!(sub.grant.scalars(), Scalars::new(1500, GIB, 0));
        assert_eq!(sub.grant.node, "n1");
        assert_eq!(sub.grant.offer_ids(), vec!["o1".to_string()]);
    }

    #[test]
    fn scalars_accumulate_across_offers() {
        let node = NodeResources::from_offers(
            "n1",
            [scalar_offer("o1", "n1", 1000, GIB), scalar_offer("o2", "n1", 1000, GIB)],
        );
        let sub = node.subtract(&ResourceRequest::new().with_cores(1500)).unwrap();

        assert_eq!(sub.grant.fragments.len(), 2);
        assert_eq!(sub.grant.fragments[0].resources.scalars.millicores, 1000);
        assert_eq!(sub.grant.fragments[1].resources.scalars.millicores, 500);
        assert_eq!(sub.remainder.scalars().millicores, 500);
    }

    #[test]
    fn shortfall_reports_available_scalars() {
        let node = NodeResources::from_offers("n1", [scalar_offer("o1", "n1", 1000, GIB)]);
        let err = node.subtract(&ResourceRequest::new().with_cores(2000)).unwrap_err();
        assert_eq!(
            err,
            Infeasible::Scalars {
                needed: Scalars::new(2000, 0, 0),
                available: Scalars::new(1000, GIB, 0),
            }
        );
    }

    #[test]
    fn non_contiguous_ports_take_lowest() {
        let node = NodeResources::from_offers("n1", [port_offer("o1", "n1", &[(9000, 9000), (7000, 7001)])]);
        let sub = node.subtract(&ResourceRequest::new().with_ports(3)).unwrap();

        assert_eq!(sub.grant.ports(), vec![7000, 7001, 9000]);
        assert_eq!(sub.remainder.offers()[0].resources.port_count(), 0);
    }

    #[test]
    fn contiguous_ports_skip_short_runs() {
        let node = NodeResources::from_offers(
            "n1",
            [port_offer("o1", "n1", &[(7000, 7001), (8000, 8009)])],
        );
        let sub = node
            .subtract(&ResourceRequest::new().with_contiguous_ports(4))
            .unwrap();

        assert_eq!(sub.grant.ports(), vec![8000, 8001, 8002, 8003]);
        assert_eq!(
            sub.remainder.offers()[0].resources.ports,
            vec![PortRange::new(7000, 7001), PortRange::new(8004, 8009)]
        );
    }

    #[test]
    fn contiguous_ports_may_span_adjacent_offers() {
        let node = NodeResources::from_offers(
            "n1",
            [
                port_offer("o1", "n1", &[(5000, 5001)]),
                port_offer("o2", "n1", &[(5002, 5003)]),
            ],
        );
        let sub = node
            .subtract(&ResourceRequest::new().with_contiguous_ports(4))
            .unwrap();

        assert_eq!(sub.grant.ports(), vec![5000, 5001, 5002, 5003]);
        assert_eq!(sub.grant.fragments.len(), 2);
    }

    #[test]
    fn contiguous_ports_fail_without_a_long_enough_run() {
        let node = NodeResources::from_offers("n1", [port_offer("o1", "n1", &[(1, 2), (4, 5)])]);
        let err = node
            .subtract(&ResourceRequest::new().with_contiguous_ports(3))
            .unwrap_err();
        assert!(matches!(err, Infeasible::Ports { requested: 3, contiguous: true }));
        assert!(node.can_satisfy(&ResourceRequest::new().with_ports(3)));
    }

    fn iface(name: &str, network: &str, bw: u64) -> InterfaceResource {
        InterfaceResource {
            name: name.to_string(),
            network: network.to_string(),
            bandwidth_bps: bw,
        }
    }

    #[test]
    fn interfaces_match_by_network_not_count() {
        let offer = Offer::new(
            "o1",
            "n1",
            ResourceSet {
                interfaces: vec![iface("eth0", "mgmt", 1_000), iface("eth1", "cbf", 40_000)],
                ..Default::default()
            },
        );
        let node = NodeResources::from_offers("n1", [offer]);

        let sub = node
            .subtract(&ResourceRequest::new().with_interface("cbf", Some(10_000)))
            .unwrap();
        let granted = sub.grant.interfaces();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].name, "eth1");
        assert_eq!(granted[0].bandwidth_bps, 10_000);

        assert!(!node.can_satisfy(&ResourceRequest::new().with_interface("sdp", None)));
    }

    #[test]
    fn interface_bandwidth_is_not_split_across_devices() {
        let offer = Offer::new(
            "o1",
            "n1",
            ResourceSet {
                interfaces: vec![iface("eth0", "cbf", 6_000), iface("eth1", "cbf", 6_000)],
                ..Default::default()
            },
        );
        let node = NodeResources::from_offers("n1", [offer]);

        assert!(!node.can_satisfy(&ResourceRequest::new().with_interface("cbf", Some(10_000))));
        assert!(node.can_satisfy(&ResourceRequest::new().with_interface("cbf", Some(6_000))));
    }

    #[test]
    fn interface_requirements_on_distinct_networks() {
        let offer = Offer::new(
            "o1",
            "n1",
            ResourceSet {
                interfaces: vec![iface("eth0", "cbf", 10_000), iface("ib0", "sdp", 0)],
                ..Default::default()
            },
        );
        let node = NodeResources::from_offers("n1", [offer]);
        let req = ResourceRequest::new()
            .with_interface("cbf", Some(1_000))
            .with_interface("sdp", None);

        let sub = node.subtract(&req).unwrap();
        let names: Vec<&str> = sub.grant.interfaces().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "ib0"]);
        assert_eq!(sub.remainder.offers()[0].resources.interfaces[0].bandwidth_bps, 9_000);
    }

    #[test]
    fn accelerators_match_by_class() {
        let offer = Offer::new(
            "o1",
            "n1",
            ResourceSet {
                accelerators: vec![
                    AcceleratorResource { id: "gpu1".into(), class: "a100".into() },
                    AcceleratorResource { id: "gpu0".into(), class: "a100".into() },
                    AcceleratorResource { id: "fpga0".into(), class: "u280".into() },
                ],
                ..Default::default()
            },
        );
        let node = NodeResources::from_offers("n1", [offer]);

        let sub = node
            .subtract(&ResourceRequest::new().with_accelerators("a100", 2))
            .unwrap();
        assert_eq!(sub.grant.accelerator_ids(), vec!["gpu0", "gpu1"]);
        assert_eq!(sub.remainder.offers()[0].resources.accelerators.len(), 1);

        let err = node
            .subtract(&ResourceRequest::new().with_accelerators("u280", 2))
            .unwrap_err();
        assert_eq!(
            err,
            Infeasible::Accelerators {
                class: "u280".into(),
                requested: 2,
                available: 1,
            }
        );
    }

    #[test]
    fn role_restricts_usable_offers() {
        let node = NodeResources::from_offers(
            "n1",
            [
                scalar_offer("o1", "n1", 1000, 0),
                scalar_offer("o2", "n1", 1000, 0).with_role("sdp"),
            ],
        );

        let sub = node
            .subtract(&ResourceRequest::new().with_cores(1000).with_role("sdp"))
            .unwrap();
        assert_eq!(sub.grant.offer_ids(), vec!["o2".to_string()]);
        assert!(!node.can_satisfy(&ResourceRequest::new().with_cores(1500).with_role("sdp")));
        assert!(node.can_satisfy(&ResourceRequest::new().with_cores(2000)));
    }

    #[test]
    fn restore_returns_fragment_to_offer() {
        let node = NodeResources::from_offers(
            "n1",
            [Offer::new(
                "o1",
                "n1",
                ResourceSet {
                    scalars: Scalars::new(2000, 0, 0),
                    ports: vec![PortRange::new(100, 109)],
                    ..Default::default()
                },
            )],
        );
        let sub = node
            .subtract(&ResourceRequest::new().with_cores(500).with_ports(2))
            .unwrap();
        let mut remainder = sub.remainder;

        for fragment in &sub.grant.fragments {
            assert!(remainder.restore(fragment));
        }
        assert_eq!(remainder, node);
    }

    #[test]
    fn restore_to_missing_offer_is_dropped() {
        let mut node = NodeResources::new("n1");
        let fragment = OfferFragment {
            offer_id: "gone".into(),
            role: ANY_ROLE.into(),
            resources: ResourceSet::default(),
        };
        assert!(!node.restore(&fragment));
    }

    #[test]
    fn expired_offers_are_dropped() {
        let mut node = NodeResources::from_offers(
            "n1",
            [
                scalar_offer("o1", "n1", 1000, 0).with_expiry(1_000),
                scalar_offer("o2", "n1", 1000, 0).with_expiry(5_000),
                scalar_offer("o3", "n1", 1000, 0),
            ],
        );
        let expired = node.drop_expired(1_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "o1");
        assert_eq!(node.offers().len(), 2);
    }

    #[test]
    fn validate_rejects_impossible_requests() {
        assert!(ResourceRequest::new().with_ports(MAX_PORTS).validate().is_ok());
        assert_eq!(
            ResourceRequest::new().with_ports(MAX_PORTS + 1).validate(),
            Err(InfeasibleRequest::TooManyPorts { requested: MAX_PORTS + 1 })
        );
        assert_eq!(
            ResourceRequest::new().with_interface(" ", None).validate(),
            Err(InfeasibleRequest::EmptyNetwork)
        );
        assert_eq!(
            ResourceRequest::new().with_accelerators("", 1).validate(),
            Err(InfeasibleRequest::EmptyAcceleratorClass)
        );
        assert_eq!(
            ResourceRequest::new().with_accelerators("a100", 0).validate(),
            Err(InfeasibleRequest::ZeroAccelerators { class: "a100".into() })
        );
        assert_eq!(
            ResourceRequest::new()
                .with_interface("cbf", None)
                .with_interface("cbf", Some(10))
                .validate(),
            Err(InfeasibleRequest::DuplicateNetwork { network: "cbf".into() })
        );
        assert_eq!(
            ResourceRequest::new().with_role("").validate(),
            Err(InfeasibleRequest::EmptyRole)
        );
    }

    #[test]
    fn combine_sums_exclusive_resources() {
        let a = ResourceRequest::new()
            .with_cores(2000)
            .with_ports(2)
            .with_interface("cbf", Some(5_000))
            .with_accelerators("a100", 1);
        let b = ResourceRequest::new()
            .with_cores(2000)
            .with_ports(1)
            .with_interface("cbf", Some(5_000))
            .with_accelerators("a100", 1);

        let combined = ResourceRequest::combine([&a, &b]);
        assert_eq!(combined.scalars.millicores, 4000);
        assert_eq!(combined.ports, 3);
        assert_eq!(combined.interfaces.len(), 1);
        assert_eq!(combined.interfaces[0].bandwidth_bps, None);
        assert_eq!(combined.accelerators[0].count, 2);
        assert_eq!(combined.role, None);
    }

    #[test]
    fn combine_keeps_shared_role() {
        let a = ResourceRequest::new().with_role("sdp");
        let b = ResourceRequest::new().with_role("sdp");
        assert_eq!(ResourceRequest::combine([&a, &b]).role.as_deref(), Some("sdp"));

        let c = ResourceRequest::new();
        assert_eq!(ResourceRequest::combine([&a, &c]).role, None);
    }

    #[test]
    fn offer_parses_from_json() {
        let json = r#"{
            "id": "o1",
            "node": "n1",
            "scalars": { "millicores": 8000, "memory_bytes": 1024 },
            "ports": [{ "begin": 100, "end": 200 }],
            "expires_at": 42
        }"#;
        let offer: Offer = serde_json::from_str(json).unwrap();
        assert_eq!(offer.role, ANY_ROLE);
        assert_eq!(offer.resources.scalars.millicores, 8000);
        assert_eq!(offer.resources.port_count(), 101);
        assert!(offer.is_expired(42));
        assert!(!offer.is_expired(41));
    }

    #[test]
    fn grants_on_same_node_with_shared_port_overlap() {
        let node = NodeResources::from_offers("n1", [port_offer("o1", "n1", &[(1, 10)])]);
        let req = ResourceRequest::new().with_ports(2);
        let first = node.subtract(&req).unwrap();
        let second = first.remainder.subtract(&req).unwrap();

        assert!(first.grant.is_disjoint_from(&second.grant));
        assert!(!first.grant.is_disjoint_from(&first.grant));
    }
}
