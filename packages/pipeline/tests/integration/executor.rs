use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::bail;
use common::{AssetType, TimeBounds};
use pipeline::{
    Candidate, DerivedPayload, NativeTransform, SweepOptions, Table, TableRow, TabularStore,
    Transform, TypeGraph,
};

use crate::support::{Harness, at, scope};

/// Tabular transform emitting one row per hour in `[from, to]`, counting calls.
fn hourly(calls: Arc<AtomicUsize>, from: i64, to: i64) -> Arc<dyn Transform> {
    NativeTransform::new("hourly", move |_candidate, _ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let rows = (from..=to)
            .map(|h| TableRow::new(at(h)).with("hour", h))
            .collect();
        Ok(DerivedPayload::Table(Table::new(rows)))
    })
    .shared()
}

/// File transform writing `{id}.{ext}` into the intermediate directory.
fn file_writer(ext: &'static str) -> Arc<dyn Transform> {
    NativeTransform::new(format!("to_{ext}"), move |candidate, ctx| {
        std::fs::create_dir_all(&ctx.intermediate_dir)?;
        let path = ctx
            .intermediate_dir
            .join(format!("{}.{ext}", candidate.label()));
        std::fs::write(&path, ext)?;
        Ok(DerivedPayload::file(path))
    })
    .shared()
}

mod end_to_end {
    use super::*;

    #[tokio::test]
    async fn raw_asset_becomes_one_derived_record() {
        let h = Harness::new().await;
        let raw_id = h.local_asset(AssetType::Sonardyne, "sonardyne.txt").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = TypeGraph::builder()
            .register(AssetType::Sonardyne, AssetType::Acoustic, hourly(calls.clone(), 0, 2))
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();

        let step = summary
            .step(AssetType::Sonardyne, AssetType::Acoustic)
            .unwrap();
        assert_eq!((step.attempted, step.succeeded, step.failed), (1, 1, 0));

        let derived = h
            .registry
            .query(&scope(), Some(AssetType::Acoustic))
            .await
            .unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].parent_id, Some(raw_id));
        assert!(derived[0].has_local_file());
        assert_eq!(derived[0].time_bounds(), Some(TimeBounds::new(at(0), at(2))));
        assert!(
            h.registry
                .link_exists(raw_id, AssetType::Acoustic)
                .await
                .unwrap()
        );
        assert_eq!(h.store.row_count("acoustic").await, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chain_runs_every_step_in_order() {
        let h = Harness::new().await;
        let raw_id = h.local_asset(AssetType::Novatel, "novatel.txt").await;
        let graph = TypeGraph::builder()
            .register(AssetType::Novatel, AssetType::Rinex, file_writer("24o"))
            .register(AssetType::Rinex, AssetType::Kin, file_writer("kin"))
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep(&scope(), AssetType::Kin, &SweepOptions::default())
            .await
            .unwrap();

        let order: Vec<_> = summary.steps.iter().map(|s| (s.source, s.target)).collect();
        assert_eq!(
            order,
            vec![
                (AssetType::Novatel, AssetType::Rinex),
                (AssetType::Rinex, AssetType::Kin)
            ]
        );
        assert_eq!(summary.succeeded(), 2);

        let rinex = h
            .registry
            .query(&scope(), Some(AssetType::Rinex))
            .await
            .unwrap();
        let kin = h
            .registry
            .query(&scope(), Some(AssetType::Kin))
            .await
            .unwrap();
        assert_eq!(rinex[0].parent_id, Some(raw_id));
        assert_eq!(kin[0].parent_id, Some(rinex[0].id));
        assert!(kin[0].has_local_file());
    }

    #[tokio::test]
    async fn side_car_target_is_written_as_json() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Master, "NCC1.master").await;
        let graph = TypeGraph::builder()
            .register(
                AssetType::Master,
                AssetType::SiteConfig,
                NativeTransform::new("master_to_siteconfig", |_, _| {
                    Ok(DerivedPayload::side_car(serde_json::json!({ "depth": 2500.0 })))
                })
                .shared(),
            )
            .build()
            .unwrap();

        h.executor(graph)
            .sweep(&scope(), AssetType::SiteConfig, &SweepOptions::default())
            .await
            .unwrap();

        let configs = h
            .registry
            .query(&scope(), Some(AssetType::SiteConfig))
            .await
            .unwrap();
        let path = configs[0].local_path.clone().unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(doc["depth"], 2500.0);
    }
}

mod override_semantics {
    use super::*;

    #[tokio::test]
    async fn linked_candidate_is_skipped_unless_overridden() {
        let h = Harness::new().await;
        let raw_id = h.local_asset(AssetType::Sonardyne, "sonardyne.txt").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = TypeGraph::builder()
            .register(AssetType::Sonardyne, AssetType::Acoustic, hourly(calls.clone(), 0, 1))
            .build()
            .unwrap();
        let executor = h.executor(graph);

        executor
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let again = executor
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(again.steps[0].skipped_done, 1);
        assert_eq!(again.steps[0].attempted, 0);

        let forced = executor
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::override_existing())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(forced.steps[0].succeeded, 1);

        let derived = h.registry.children_of(raw_id, Some(AssetType::Acoustic)).await.unwrap();
        assert_eq!(derived.len(), 2);
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn one_failing_candidate_does_not_stop_siblings() {
        let h = Harness::new().await;
        let first = h.local_asset(AssetType::Sonardyne, "a_sonardyne.txt").await;
        let second = h.local_asset(AssetType::Sonardyne, "b_sonardyne.txt").await;
        let third = h.local_asset(AssetType::Sonardyne, "c_sonardyne.txt").await;

        let graph = TypeGraph::builder()
            .register(
                AssetType::Sonardyne,
                AssetType::Acoustic,
                NativeTransform::new("flaky", move |candidate, _| {
                    if candidate.ids() == vec![second] {
                        bail!("corrupt ping block at byte 4096");
                    }
                    Ok(DerivedPayload::Table(Table::new(vec![TableRow::new(at(0))])))
                })
                .shared(),
            )
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();

        let step = &summary.steps[0];
        assert_eq!((step.attempted, step.succeeded, step.failed), (3, 2, 1));
        assert_eq!(step.failures[0].asset_ids, vec![second]);
        assert!(step.failures[0].error.contains("corrupt ping block"));
        assert_eq!(summary.failed_asset_ids(), vec![second]);

        for id in [first, third] {
            assert!(h.registry.link_exists(id, AssetType::Acoustic).await.unwrap());
        }
        assert!(!h.registry.link_exists(second, AssetType::Acoustic).await.unwrap());
    }

    #[tokio::test]
    async fn panicking_transform_is_a_candidate_failure() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Seabird, "NCC1_svpavg.txt").await;
        let graph = TypeGraph::builder()
            .register(
                AssetType::Seabird,
                AssetType::Svp,
                NativeTransform::new("explodes", |_, _| panic!("index out of range")).shared(),
            )
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep(&scope(), AssetType::Svp, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.steps[0].failed, 1);
        assert_eq!(summary.steps[0].succeeded, 0);
    }

    #[tokio::test]
    async fn wrong_payload_kind_fails_the_candidate() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Sonardyne, "sonardyne.txt").await;
        let graph = TypeGraph::builder()
            .register(
                AssetType::Sonardyne,
                AssetType::Acoustic,
                NativeTransform::new("confused", |_, _| {
                    Ok(DerivedPayload::side_car(serde_json::json!({})))
                })
                .shared(),
            )
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.steps[0].failed, 1);
        assert!(
            h.registry
                .query(&scope(), Some(AssetType::Acoustic))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn retry_reprocesses_only_failed_candidates() {
        let h = Harness::new().await;
        let good = h.local_asset(AssetType::Sonardyne, "a_sonardyne.txt").await;
        let bad = h.local_asset(AssetType::Sonardyne, "b_sonardyne.txt").await;
        let broken = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));

        let transform = {
            let broken = broken.clone();
            let calls = calls.clone();
            NativeTransform::new("recovering", move |candidate: &Candidate, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                if candidate.ids() == vec![bad] && broken.load(Ordering::SeqCst) {
                    bail!("archive server returned 503");
                }
                Ok(DerivedPayload::Table(Table::new(vec![TableRow::new(at(1))])))
            })
            .shared()
        };
        let graph = TypeGraph::builder()
            .register(AssetType::Sonardyne, AssetType::Acoustic, transform)
            .build()
            .unwrap();
        let executor = h.executor(graph);

        let first = executor
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(first.failed_asset_ids(), vec![bad]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        broken.store(false, Ordering::SeqCst);
        let retry = executor
            .retry_failed(&first, &SweepOptions::default())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.steps.len(), 1);
        assert_eq!(retry.steps[0].attempted, 1);
        assert_eq!(retry.steps[0].succeeded, 1);
        assert!(retry.failed_asset_ids().is_empty());
        for id in [good, bad] {
            assert!(h.registry.link_exists(id, AssetType::Acoustic).await.unwrap());
        }
    }
}

mod timestamps {
    use super::*;

    #[tokio::test]
    async fn parent_bounds_widen_but_never_narrow() {
        let h = Harness::new().await;
        let raw_id = h.local_asset(AssetType::Sonardyne, "sonardyne.txt").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = TypeGraph::builder()
            .register(AssetType::Sonardyne, AssetType::Acoustic, hourly(calls.clone(), 2, 4))
            .register(AssetType::Sonardyne, AssetType::ShotData, hourly(calls.clone(), 1, 5))
            .register(AssetType::Sonardyne, AssetType::ImuPosition, hourly(calls.clone(), 3, 3))
            .build()
            .unwrap();
        let executor = h.executor(graph);
        let opts = SweepOptions::default();
        assert_eq!(h.registry.get(raw_id).await.unwrap().time_bounds(), None);

        executor
            .sweep_link(&scope(), AssetType::Sonardyne, AssetType::Acoustic, &opts)
            .await
            .unwrap();
        assert_eq!(
            h.registry.get(raw_id).await.unwrap().time_bounds(),
            Some(TimeBounds::new(at(2), at(4)))
        );

        executor
            .sweep_link(&scope(), AssetType::Sonardyne, AssetType::ShotData, &opts)
            .await
            .unwrap();
        assert_eq!(
            h.registry.get(raw_id).await.unwrap().time_bounds(),
            Some(TimeBounds::new(at(1), at(5)))
        );

        executor
            .sweep_link(&scope(), AssetType::Sonardyne, AssetType::ImuPosition, &opts)
            .await
            .unwrap();
        assert_eq!(
            h.registry.get(raw_id).await.unwrap().time_bounds(),
            Some(TimeBounds::new(at(1), at(5)))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn file_output_inherits_parent_bounds() {
        let h = Harness::new().await;
        let path = h.write_source("novatel.txt", b"raw");
        let raw_id = h
            .registry
            .insert(
                catalog::NewAsset::local(scope(), AssetType::Novatel, path)
                    .with_bounds(Some(TimeBounds::new(at(0), at(6)))),
            )
            .await
            .unwrap();
        let graph = TypeGraph::builder()
            .register(AssetType::Novatel, AssetType::Rinex, file_writer("24o"))
            .build()
            .unwrap();

        h.executor(graph)
            .sweep(&scope(), AssetType::Rinex, &SweepOptions::default())
            .await
            .unwrap();

        let rinex = h.registry.children_of(raw_id, Some(AssetType::Rinex)).await.unwrap();
        assert_eq!(rinex[0].time_bounds(), Some(TimeBounds::new(at(0), at(6))));
    }
}

mod resolution {
    use super::*;

    #[tokio::test]
    async fn unproduced_target_is_reported_unresolved() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Seabird, "NCC1_svpavg.txt").await;
        let graph = TypeGraph::builder()
            .register(AssetType::Novatel, AssetType::Rinex, file_writer("24o"))
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep(&scope(), AssetType::Svp, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.unresolved, vec![AssetType::Svp]);
        assert!(summary.steps.is_empty());
    }

    #[tokio::test]
    async fn unregistered_link_counts_candidates_as_skipped() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Seabird, "a_svpavg.txt").await;
        h.local_asset(AssetType::Seabird, "b_svpavg.txt").await;
        let graph = TypeGraph::builder()
            .register(AssetType::Novatel, AssetType::Rinex, file_writer("24o"))
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep_link(
                &scope(),
                AssetType::Seabird,
                AssetType::Svp,
                &SweepOptions::default(),
            )
            .await
            .unwrap();
        let step = &summary.steps[0];
        assert_eq!(step.transform, None);
        assert_eq!(step.skipped_no_transform, 2);
        assert_eq!(step.attempted, 0);
    }

    #[tokio::test]
    async fn forward_sweep_covers_all_descendants() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Novatel, "novatel.txt").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = TypeGraph::builder()
            .register(AssetType::Novatel, AssetType::Rinex, file_writer("24o"))
            .register(AssetType::Rinex, AssetType::Kin, file_writer("kin"))
            .register(AssetType::Novatel, AssetType::ImuPosition, hourly(calls.clone(), 0, 0))
            .register(AssetType::Sonardyne, AssetType::Acoustic, hourly(calls.clone(), 0, 0))
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep_from(&scope(), AssetType::Novatel, &SweepOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.steps.len(), 3);
        assert!(summary.step(AssetType::Sonardyne, AssetType::Acoustic).is_none());
        assert_eq!(summary.succeeded(), 3);
        assert_eq!(h.store.row_count("imuposition").await, 1);
    }

    #[tokio::test]
    async fn sources_without_local_bytes_are_skipped() {
        let h = Harness::new().await;
        h.registry
            .insert(catalog::NewAsset::remote(
                scope(),
                AssetType::Sonardyne,
                "s3://bucket/NCC1/sonardyne.txt",
                common::RemoteKind::S3,
            ))
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = TypeGraph::builder()
            .register(AssetType::Sonardyne, AssetType::Acoustic, hourly(calls.clone(), 0, 0))
            .build()
            .unwrap();

        let summary = h
            .executor(graph)
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.steps[0].skipped_not_local, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

mod batches {
    use super::*;

    #[tokio::test]
    async fn batch_transform_sees_all_unprocessed_sources_once() {
        let h = Harness::new().await;
        let mut ids = Vec::new();
        for name in ["a_NOV770.raw", "b_NOV770.raw", "c_NOV770.raw"] {
            ids.push(h.local_asset(AssetType::Novatel770, name).await);
        }
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let transform = {
            let seen = seen.clone();
            NativeTransform::new("tile", move |candidate: &Candidate, _| {
                seen.lock().unwrap().push(candidate.ids());
                Ok(DerivedPayload::Table(Table::new(vec![TableRow::new(at(0))])))
            })
            .batch()
            .shared()
        };
        let graph = TypeGraph::builder()
            .register(AssetType::Novatel770, AssetType::GnssObsTdb, transform)
            .build()
            .unwrap();
        let executor = h.executor(graph);

        let summary = executor
            .sweep(&scope(), AssetType::GnssObsTdb, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.steps[0].attempted, 1);
        assert_eq!(*seen.lock().unwrap(), vec![ids.clone()]);
        for id in &ids {
            assert!(h.registry.link_exists(*id, AssetType::GnssObsTdb).await.unwrap());
        }
        assert!(
            h.registry
                .batch_link_exists(&scope(), AssetType::Novatel770, AssetType::GnssObsTdb, &ids)
                .await
                .unwrap()
        );

        let late = h.local_asset(AssetType::Novatel770, "d_NOV770.raw").await;
        let second = executor
            .sweep(&scope(), AssetType::GnssObsTdb, &SweepOptions::default())
            .await
            .unwrap();
        assert_eq!(second.steps[0].skipped_done, 3);
        assert_eq!(seen.lock().unwrap().last(), Some(&vec![late]));

        let merged = h
            .registry
            .query(&scope(), Some(AssetType::GnssObsTdb))
            .await
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|m| m.parent_id.is_none()));
    }
}

mod deadlines {
    use super::*;

    #[tokio::test]
    async fn expired_deadline_leaves_steps_pending() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Novatel, "novatel.txt").await;
        let graph = TypeGraph::builder()
            .register(AssetType::Novatel, AssetType::Rinex, file_writer("24o"))
            .register(AssetType::Rinex, AssetType::Kin, file_writer("kin"))
            .build()
            .unwrap();

        let opts = SweepOptions::default().with_deadline(tokio::time::Instant::now());
        let summary = h
            .executor(graph)
            .sweep(&scope(), AssetType::Kin, &opts)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(summary.steps.is_empty());
        assert_eq!(
            summary.pending,
            vec![
                (AssetType::Novatel, AssetType::Rinex),
                (AssetType::Rinex, AssetType::Kin)
            ]
        );
    }
}

mod coverage {
    use super::*;

    #[tokio::test]
    async fn store_keeps_rows_from_every_candidate() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Sonardyne, "a_sonardyne.txt").await;
        h.local_asset(AssetType::Sonardyne, "b_sonardyne.txt").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = TypeGraph::builder()
            .register(AssetType::Sonardyne, AssetType::Acoustic, hourly(calls, 0, 23))
            .build()
            .unwrap();

        h.executor(graph)
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();

        assert_eq!(h.store.row_count("acoustic").await, 48);
        let dates = h.store.dates("acoustic").await.unwrap();
        assert_eq!(dates.len(), 1);
    }
}

mod scope_locking {
    use std::time::Duration;

    use super::*;

    /// Table transform that records how many invocations overlap.
    fn slow(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<dyn Transform> {
        NativeTransform::new("slow", move |_, _| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(DerivedPayload::Table(Table::new(vec![TableRow::new(at(0))])))
        })
        .shared()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweeps_on_one_scope_do_not_overlap() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Sonardyne, "sonardyne.txt").await;
        h.local_asset(AssetType::Seabird, "NCC1_svpavg.txt").await;
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let graph = TypeGraph::builder()
            .register(
                AssetType::Sonardyne,
                AssetType::Acoustic,
                slow(active.clone(), peak.clone()),
            )
            .register(AssetType::Seabird, AssetType::Svp, slow(active, peak.clone()))
            .build()
            .unwrap();
        let executor = h.executor(graph);
        let opts = SweepOptions::default();

        let scope = scope();
        let (acoustic, svp) = tokio::join!(
            executor.sweep(&scope, AssetType::Acoustic, &opts),
            executor.sweep(&scope, AssetType::Svp, &opts),
        );

        assert_eq!(acoustic.unwrap().succeeded(), 1);
        assert_eq!(svp.unwrap().succeeded(), 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finished_sweeps_release_their_scope() {
        let h = Harness::new().await;
        h.local_asset(AssetType::Sonardyne, "sonardyne.txt").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = TypeGraph::builder()
            .register(AssetType::Sonardyne, AssetType::Acoustic, hourly(calls, 0, 0))
            .build()
            .unwrap();
        let executor = h.executor(graph);

        executor
            .sweep(&scope(), AssetType::Acoustic, &SweepOptions::default())
            .await
            .unwrap();
        executor
            .sweep(
                &common::Scope::new("N", "S2", "V"),
                AssetType::Acoustic,
                &SweepOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(executor.busy_scopes(), 0);
    }
}
