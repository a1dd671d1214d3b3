use std::fs;
use std::path::Path;

use tempfile::TempDir;

use respolicy_topology::system::{CoreKind, MemType};
use respolicy_topology::{DiscoveryError, SysFs};

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

// Four CPUs in one package, a hybrid base-frequency histogram, one DRAM
// node with CPUs and one CPU-less node at PMEM distance.
fn fake_sysfs() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    write(root, "devices/system/cpu/online", "0-3\n");
    write(root, "devices/system/cpu/isolated", "2-3\n");
    for cpu in 0..4u32 {
        let d = format!("devices/system/cpu/cpu{}", cpu);
        write(root, &format!("{}/topology/physical_package_id", d), "0\n");
        write(root, &format!("{}/topology/core_id", d), &format!("{}\n", cpu));
        write(root, &format!("{}/topology/die_id", d), "0\n");
        write(root, &format!("{}/topology/core_cpus_list", d), &format!("{}\n", cpu));
        let base = if cpu < 2 { "3000000" } else { "2100000" };
        write(root, &format!("{}/cpufreq/base_frequency", d), base);
        write(root, &format!("{}/cpufreq/cpuinfo_min_freq", d), "800000\n");
        write(root, &format!("{}/cpufreq/cpuinfo_max_freq", d), "4500000\n");
        write(root, &format!("{}/cache/index0/level", d), "1\n");
        write(root, &format!("{}/cache/index0/type", d), "Data\n");
        write(root, &format!("{}/cache/index0/shared_cpu_list", d), &format!("{}\n", cpu));
        write(root, &format!("{}/cache/index0/id", d), &format!("{}\n", cpu));
        write(root, &format!("{}/cache/index0/size", d), "48K\n");
        let l2_id = cpu / 2;
        let l2_shared = if cpu < 2 { "0-1" } else { "2-3" };
        write(root, &format!("{}/cache/index1/level", d), "2\n");
        write(root, &format!("{}/cache/index1/type", d), "Unified\n");
        write(root, &format!("{}/cache/index1/shared_cpu_list", d), l2_shared);
        write(root, &format!("{}/cache/index1/id", d), &format!("{}\n", l2_id));
        write(root, &format!("{}/cache/index1/size", d), "2M\n");
    }

    write(root, "devices/system/node/node0/cpulist", "0-3\n");
    write(
        root,
        "devices/system/node/node0/meminfo",
        "Node 0 MemTotal:       16777216 kB\nNode 0 MemFree:        1234 kB\n",
    );
    write(root, "devices/system/node/node0/distance", "10 28\n");
    write(
        root,
        "devices/system/node/node0/hugepages/hugepages-2048kB/nr_hugepages",
        "128\n",
    );

    write(root, "devices/system/node/node1/cpulist", "\n");
    write(
        root,
        "devices/system/node/node1/meminfo",
        "Node 1 MemTotal:       33554432 kB\n",
    );
    write(root, "devices/system/node/node1/distance", "28 10\n");

    dir
}

#[test]
fn discovers_cpus_nodes_and_caches() {
    let dir = fake_sysfs();
    let system = SysFs::new(dir.path()).discover().unwrap();

    assert_eq!(system.cpu_ids().to_string(), "0-3");
    assert_eq!(system.isolated_cpus().to_string(), "2-3");
    assert_eq!(system.package_ids().len(), 1);

    let cpu0 = system.cpu(0).unwrap();
    assert_eq!(cpu0.numa_node, 0);
    assert_eq!(cpu0.base_freq_khz, 3000000);
    assert_eq!(cpu0.min_freq_khz, 800000);
    assert_eq!(cpu0.max_freq_khz, 4500000);

    // Two L2 instances, deduplicated across the sharing CPUs.
    let l2: Vec<_> = system.caches().iter().filter(|c| c.level == 2).collect();
    assert_eq!(l2.len(), 2);
    assert_eq!(l2[0].size_kb, 2048);
    assert_eq!(system.l2_group(3).unwrap().to_string(), "2-3");
}

#[test]
// The base-frequency histogram splits performance and efficient cores.
fn infers_core_kinds_from_frequency_histogram() {
    let dir = fake_sysfs();
    let system = SysFs::new(dir.path()).discover().unwrap();
    assert_eq!(system.cpu(0).unwrap().core_kind, CoreKind::Performance);
    assert_eq!(system.cpu(1).unwrap().core_kind, CoreKind::Performance);
    assert_eq!(system.cpu(2).unwrap().core_kind, CoreKind::Efficient);
    assert_eq!(system.cpu(3).unwrap().core_kind, CoreKind::Efficient);
}

#[test]
// A CPU-less node at SLIT distance 28 is typed as persistent memory.
fn types_cpuless_node_by_distance() {
    let dir = fake_sysfs();
    let system = SysFs::new(dir.path()).discover().unwrap();
    assert_eq!(system.node(0).unwrap().mem_type, MemType::Dram);
    assert_eq!(system.node(0).unwrap().mem_total_kb, 16777216);
    assert_eq!(system.node(0).unwrap().hugepages.get(&2048), Some(&128));
    assert_eq!(system.node(1).unwrap().mem_type, MemType::Pmem);
    assert!(system.node(1).unwrap().cpus.is_empty());
    assert_eq!(system.node_distance(0, 1), 28);
}

#[test]
// Missing required files are I/O-classified and abort discovery.
fn missing_required_file_is_io_error() {
    let dir = fake_sysfs();
    fs::remove_file(dir.path().join("devices/system/cpu/online")).unwrap();
    match SysFs::new(dir.path()).discover() {
        Err(DiscoveryError::Io { path, .. }) => assert!(path.ends_with("devices/system/cpu/online")),
        other => panic!("expected Io error, got {:?}", other.map(|_| ())),
    }
}

#[test]
// Corrupt content is parse-classified.
fn malformed_distance_is_parse_error() {
    let dir = fake_sysfs();
    write(dir.path(), "devices/system/node/node0/distance", "10 banana\n");
    match SysFs::new(dir.path()).discover() {
        Err(DiscoveryError::Parse { path, .. }) => assert!(path.contains("node0/distance")),
        other => panic!("expected Parse error, got {:?}", other.map(|_| ())),
    }
}

#[test]
// Optional files may be absent without failing discovery.
fn optional_files_default_silently() {
    let dir = fake_sysfs();
    fs::remove_file(dir.path().join("devices/system/cpu/isolated")).unwrap();
    for cpu in 0..4 {
        fs::remove_file(
            dir.path()
                .join(format!("devices/system/cpu/cpu{}/cpufreq/base_frequency", cpu)),
        )
        .unwrap();
    }
    let system = SysFs::new(dir.path()).discover().unwrap();
    assert!(system.isolated_cpus().is_empty());
    assert_eq!(system.cpu(0).unwrap().base_freq_khz, 0);
    assert_eq!(system.cpu(0).unwrap().core_kind, CoreKind::Unknown);
}
