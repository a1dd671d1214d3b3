//! Sysfs topology discovery.
//!
//! Reads the hardware description from `/sys` (or any rooted copy of it,
//! which is what `--host-root` and the discovery tests use). Required files
//! that cannot be read or parsed abort discovery with a classified error;
//! optional files (cluster id, cpufreq, caches, hugepages) default silently.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use log::debug;
use thiserror::Error;

use crate::cpuset::CpuSet;
use crate::system::{CacheInfo, CoreKind, CpuInfo, MemType, NodeInfo, System};

/// Discovery failure, classified per the error taxonomy.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// A required sysfs file could not be read.
    #[error("sysfs read failed at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A sysfs file held content we cannot interpret.
    #[error("sysfs parse failed at {path}: {what}")]
    Parse {
        /// Offending path.
        path: String,
        /// What was wrong with the content.
        what: String,
    },
}

/// Reader rooted at a sysfs mount (normally `<host-root>/sys`).
pub struct SysFs {
    root: PathBuf,
}

// Memory-only nodes are typed by their distance from the nearest CPU node.
// HBM sits closer than the SLIT default of 20 for remote DRAM, persistent
// memory further, CXL expanders furthest.
const HBM_DISTANCE_MAX: u32 = 19;
const PMEM_DISTANCE_MAX: u32 = 29;

impl SysFs {
    /// Creates a reader rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Discovers the full hardware description.
    pub fn discover(&self) -> Result<System, DiscoveryError> {
        let online = self.read_required_cpuset("devices/system/cpu/online")?;
        let isolated = self
            .read_optional_cpuset("devices/system/cpu/isolated")?
            .unwrap_or_default();

        let mut nodes = self.discover_nodes()?;
        let mut cpu_to_node = BTreeMap::new();
        for node in nodes.values() {
            for cpu in node.cpus.iter() {
                cpu_to_node.insert(cpu, node.id);
            }
        }

        let mut cpus = Vec::new();
        let mut caches: Vec<CacheInfo> = Vec::new();
        for id in online.iter() {
            let cpu_dir = format!("devices/system/cpu/cpu{}", id);
            let package_id = self.read_required_u64(&format!("{}/topology/physical_package_id", cpu_dir))? as u32;
            let core_id = self.read_required_u64(&format!("{}/topology/core_id", cpu_dir))? as u32;
            let die_id = self
                .read_optional_u64(&format!("{}/topology/die_id", cpu_dir))?
                .unwrap_or(0) as u32;
            let cluster_id = self
                .read_optional_i64(&format!("{}/topology/cluster_id", cpu_dir))?
                .filter(|v| *v >= 0)
                .map(|v| v as u32);
            let core_cpus = match self.read_optional_cpuset(&format!("{}/topology/core_cpus_list", cpu_dir))? {
                Some(set) => set,
                None => self
                    .read_optional_cpuset(&format!("{}/topology/thread_siblings_list", cpu_dir))?
                    .unwrap_or_else(|| [id].into_iter().collect()),
            };
            let base_freq_khz = self
                .read_optional_u64(&format!("{}/cpufreq/base_frequency", cpu_dir))?
                .unwrap_or(0);
            let min_freq_khz = self
                .read_optional_u64(&format!("{}/cpufreq/cpuinfo_min_freq", cpu_dir))?
                .unwrap_or(0);
            let max_freq_khz = self
                .read_optional_u64(&format!("{}/cpufreq/cpuinfo_max_freq", cpu_dir))?
                .unwrap_or(0);

            let numa_node = *cpu_to_node.get(&id).ok_or_else(|| DiscoveryError::Parse {
                path: self.path("devices/system/node"),
                what: format!("cpu {} not listed in any node's cpulist", id),
            })?;

            self.discover_cpu_caches(id, &cpu_dir, &mut caches)?;

            cpus.push(CpuInfo {
                id,
                package_id,
                die_id,
                cluster_id,
                core_id,
                numa_node,
                core_cpus,
                base_freq_khz,
                min_freq_khz,
                max_freq_khz,
                core_kind: CoreKind::Unknown,
            });
        }

        infer_core_kinds(&mut cpus);
        type_memory_nodes(&mut nodes);

        debug!(
            target: "discovery",
            "discovered {} cpus, {} nodes, {} caches, isolated [{}]",
            cpus.len(),
            nodes.len(),
            caches.len(),
            isolated
        );
        Ok(System::from_parts(cpus, nodes.into_values().collect(), caches, isolated))
    }

    fn discover_nodes(&self) -> Result<BTreeMap<u32, NodeInfo>, DiscoveryError> {
        let node_root = self.path("devices/system/node");
        let mut node_ids = Vec::new();
        let entries = std::fs::read_dir(&node_root).map_err(|source| DiscoveryError::Io {
            path: node_root.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<u32>().ok()) {
                node_ids.push(id);
            }
        }
        if node_ids.is_empty() {
            return Err(DiscoveryError::Parse {
                path: node_root,
                what: "no NUMA nodes found".to_string(),
            });
        }
        node_ids.sort_unstable();

        let mut nodes = BTreeMap::new();
        for &id in &node_ids {
            let dir = format!("devices/system/node/node{}", id);
            let cpus = self.read_required_cpuset(&format!("{}/cpulist", dir))?;
            let mem_total_kb = self.read_node_memtotal(&format!("{}/meminfo", dir))?;
            let distances = self.read_node_distances(&format!("{}/distance", dir), &node_ids)?;
            let hugepages = self.read_node_hugepages(&dir)?;
            nodes.insert(
                id,
                NodeInfo {
                    id,
                    cpus,
                    mem_total_kb,
                    mem_type: MemType::Dram,
                    distances,
                    hugepages,
                },
            );
        }
        Ok(nodes)
    }

    fn discover_cpu_caches(&self, cpu: u32, cpu_dir: &str, caches: &mut Vec<CacheInfo>) -> Result<(), DiscoveryError> {
        for index in 0.. {
            let dir = format!("{}/cache/index{}", cpu_dir, index);
            let level = match self.read_optional_u64(&format!("{}/level", dir))? {
                Some(level) => level as u32,
                None => break,
            };
            let ty = self.read_optional(&format!("{}/type", dir))?.unwrap_or_default();
            if ty.trim() == "Instruction" {
                continue;
            }
            let shared_cpus = self
                .read_optional_cpuset(&format!("{}/shared_cpu_list", dir))?
                .unwrap_or_else(|| [cpu].into_iter().collect());
            let id = self.read_optional_u64(&format!("{}/id", dir))?.unwrap_or(u64::from(cpu)) as u32;
            let size_kb = match self.read_optional(&format!("{}/size", dir))? {
                Some(s) => parse_cache_size_kb(&s).ok_or_else(|| DiscoveryError::Parse {
                    path: self.path(&format!("{}/size", dir)),
                    what: format!("bad cache size {:?}", s.trim()),
                })?,
                None => 0,
            };
            if !caches.iter().any(|c| c.level == level && c.id == id) {
                caches.push(CacheInfo {
                    id,
                    level,
                    shared_cpus,
                    size_kb,
                });
            }
        }
        Ok(())
    }

    fn read_node_memtotal(&self, rel: &str) -> Result<u64, DiscoveryError> {
        let content = self.read_required(rel)?;
        for line in content.lines() {
            if let Some(rest) = line.split("MemTotal:").nth(1) {
                let kb = rest.trim().trim_end_matches("kB").trim();
                return kb.parse().map_err(|_| DiscoveryError::Parse {
                    path: self.path(rel),
                    what: format!("bad MemTotal value {:?}", kb),
                });
            }
        }
        Err(DiscoveryError::Parse {
            path: self.path(rel),
            what: "no MemTotal line".to_string(),
        })
    }

    fn read_node_distances(&self, rel: &str, node_ids: &[u32]) -> Result<BTreeMap<u32, u32>, DiscoveryError> {
        let content = self.read_required(rel)?;
        let values: Vec<u32> = content
            .split_whitespace()
            .map(|v| {
                v.parse().map_err(|_| DiscoveryError::Parse {
                    path: self.path(rel),
                    what: format!("bad distance {:?}", v),
                })
            })
            .collect::<Result<_, _>>()?;
        if values.len() != node_ids.len() {
            return Err(DiscoveryError::Parse {
                path: self.path(rel),
                what: format!("expected {} distances, got {}", node_ids.len(), values.len()),
            });
        }
        Ok(node_ids.iter().copied().zip(values).collect())
    }

    fn read_node_hugepages(&self, node_dir: &str) -> Result<BTreeMap<u64, u64>, DiscoveryError> {
        let mut pages = BTreeMap::new();
        let dir = self.path(&format!("{}/hugepages", node_dir));
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(pages),
            Err(source) => return Err(DiscoveryError::Io { path: dir, source }),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let size_kb = match name
                .strip_prefix("hugepages-")
                .and_then(|s| s.strip_suffix("kB"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(size) => size,
                None => continue,
            };
            if let Some(count) = self.read_optional_u64(&format!("{}/hugepages/{}/nr_hugepages", node_dir, name))? {
                pages.insert(size_kb, count);
            }
        }
        Ok(pages)
    }

    fn path(&self, rel: &str) -> String {
        self.root.join(rel).to_string_lossy().into_owned()
    }

    fn read_required(&self, rel: &str) -> Result<String, DiscoveryError> {
        std::fs::read_to_string(self.root.join(rel)).map_err(|source| DiscoveryError::Io {
            path: self.path(rel),
            source,
        })
    }

    fn read_optional(&self, rel: &str) -> Result<Option<String>, DiscoveryError> {
        match std::fs::read_to_string(self.root.join(rel)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(DiscoveryError::Io {
                path: self.path(rel),
                source,
            }),
        }
    }

    fn read_required_u64(&self, rel: &str) -> Result<u64, DiscoveryError> {
        let content = self.read_required(rel)?;
        content.trim().parse().map_err(|_| DiscoveryError::Parse {
            path: self.path(rel),
            what: format!("bad integer {:?}", content.trim()),
        })
    }

    fn read_optional_u64(&self, rel: &str) -> Result<Option<u64>, DiscoveryError> {
        match self.read_optional(rel)? {
            Some(content) => content
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| DiscoveryError::Parse {
                    path: self.path(rel),
                    what: format!("bad integer {:?}", content.trim()),
                }),
            None => Ok(None),
        }
    }

    fn read_optional_i64(&self, rel: &str) -> Result<Option<i64>, DiscoveryError> {
        match self.read_optional(rel)? {
            Some(content) => content
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| DiscoveryError::Parse {
                    path: self.path(rel),
                    what: format!("bad integer {:?}", content.trim()),
                }),
            None => Ok(None),
        }
    }

    fn read_required_cpuset(&self, rel: &str) -> Result<CpuSet, DiscoveryError> {
        let content = self.read_required(rel)?;
        CpuSet::parse(&content).map_err(|e| DiscoveryError::Parse {
            path: self.path(rel),
            what: e.to_string(),
        })
    }

    fn read_optional_cpuset(&self, rel: &str) -> Result<Option<CpuSet>, DiscoveryError> {
        match self.read_optional(rel)? {
            Some(content) => CpuSet::parse(&content)
                .map(Some)
                .map_err(|e| DiscoveryError::Parse {
                    path: self.path(rel),
                    what: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}

/// Classifies cores from the base-frequency histogram when the kernel does
/// not expose core kinds directly: on a hybrid machine the highest base
/// frequency marks performance cores. A uniform histogram tells nothing.
fn infer_core_kinds(cpus: &mut [CpuInfo]) {
    let mut freqs: Vec<u64> = cpus.iter().map(|c| c.base_freq_khz).filter(|f| *f > 0).collect();
    freqs.sort_unstable();
    freqs.dedup();
    if freqs.len() < 2 {
        return;
    }
    let top = *freqs.last().unwrap();
    for cpu in cpus.iter_mut() {
        if cpu.base_freq_khz == 0 {
            continue;
        }
        cpu.core_kind = if cpu.base_freq_khz == top {
            CoreKind::Performance
        } else {
            CoreKind::Efficient
        };
    }
}

fn type_memory_nodes(nodes: &mut BTreeMap<u32, NodeInfo>) {
    let cpu_nodes: Vec<u32> = nodes.values().filter(|n| !n.cpus.is_empty()).map(|n| n.id).collect();
    let mut types = BTreeMap::new();
    for node in nodes.values() {
        if !node.cpus.is_empty() {
            types.insert(node.id, MemType::Dram);
            continue;
        }
        let nearest = cpu_nodes
            .iter()
            .map(|id| node.distances.get(id).copied().unwrap_or(u32::MAX))
            .min()
            .unwrap_or(u32::MAX);
        let ty = if nearest <= HBM_DISTANCE_MAX {
            MemType::Hbm
        } else if nearest <= PMEM_DISTANCE_MAX {
            MemType::Pmem
        } else {
            MemType::Cxl
        };
        types.insert(node.id, ty);
    }
    for (id, ty) in types {
        if let Some(node) = nodes.get_mut(&id) {
            node.mem_type = ty;
        }
    }
}

/// Parses cache sizes like `"32K"`, `"1024K"`, `"8M"` into kB.
fn parse_cache_size_kb(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(v) = s.strip_suffix('K') {
        return v.parse().ok();
    }
    if let Some(v) = s.strip_suffix('M') {
        return v.parse::<u64>().ok().map(|v| v * 1024);
    }
    if let Some(v) = s.strip_suffix('G') {
        return v.parse::<u64>().ok().map(|v| v * 1024 * 1024);
    }
    s.parse().ok()
}
