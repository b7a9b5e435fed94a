//! Scan and reconcile benchmarks
//!
//! Benchmarks for measuring:
//! - Diffing two network trees of growing size
//! - Sorting a freshly scanned tree
//! - A full scan of a simulated network
//!
//! Run with: cargo bench --bench reconcile -p smbnet-daemon

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use smbnet_daemon::{reconcile, scan_network, MemoryNetwork, RemoteLock, TreeNode};

/// Network with `workgroups` workgroups of 16 servers with 4 shares each
fn build_tree(workgroups: usize, skip_every: usize) -> TreeNode {
    let mut root = TreeNode::network();
    for w in 0..workgroups {
        let wg = root.add_child(TreeNode::workgroup(&format!("WG{:03}", w)));
        for s in 0..16 {
            if skip_every > 0 && (w * 16 + s) % skip_every == 0 {
                continue;
            }
            let server = wg.add_child(TreeNode::server(&format!("WG{:03}-SRV{:02}", w, s), ""));
            for share in 0..4 {
                server.add_child(TreeNode::share(&format!("share{}", share), ""));
            }
        }
    }
    root.sort();
    root
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");

    for workgroups in [1usize, 16, 128] {
        let old = build_tree(workgroups, 0);
        let new = build_tree(workgroups, 7);
        group.throughput(Throughput::Elements(old.descendant_count() as u64));

        group.bench_with_input(
            BenchmarkId::new("unchanged", workgroups),
            &old,
            |b, tree| b.iter(|| reconcile(black_box(tree), black_box(tree))),
        );
        group.bench_with_input(
            BenchmarkId::new("churn", workgroups),
            &(old, new),
            |b, (old, new)| b.iter(|| reconcile(black_box(old), black_box(new))),
        );
    }

    group.finish();
}

fn bench_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_sort");

    for workgroups in [16usize, 128] {
        let mut reversed = build_tree(workgroups, 0);
        reversed.children.reverse();
        group.bench_with_input(
            BenchmarkId::new("workgroups", workgroups),
            &reversed,
            |b, tree| {
                b.iter(|| {
                    let mut tree = tree.clone();
                    tree.sort();
                    black_box(tree)
                })
            },
        );
    }

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let network = MemoryNetwork::new();
    for w in 0..8 {
        for s in 0..16 {
            let server = format!("WG{}-SRV{:02}", w, s);
            network.add_server(&format!("WG{}", w), &server, "");
            for share in 0..4 {
                network.add_share(&server, &format!("share{}", share), "");
            }
        }
    }
    let remote = RemoteLock::new(network);

    c.bench_function("scan_network_512_shares", |b| {
        b.iter(|| black_box(scan_network(&remote)))
    });
}

criterion_group!(benches, bench_reconcile, bench_sort, bench_scan);
criterion_main!(benches);
