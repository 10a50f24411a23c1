use std::sync::Arc;

use procdash::broadcast::{Broadcaster, ChannelSubscriber, Event};
use procdash::config::Config;
use procdash::series::compact::resample;
use procdash::series::Series;
use procdash::source::{HostSnapshot, ProcessSample, SystemSample};
use procdash::store::worker;
use procdash::store::{LogKind, Store};
use tokio_util::sync::CancellationToken;

/// 2024-03-15T00:00:00Z.
const START: i64 = 1_710_460_800_000;
const MINUTE: i64 = 60_000;

fn snapshot(time: i64, processes: &[(u32, f64)]) -> HostSnapshot {
    HostSnapshot {
        name: "web-1".to_string(),
        time,
        system: SystemSample {
            time,
            ..Default::default()
        },
        processes: processes
            .iter()
            .map(|&(id, cpu)| ProcessSample {
                id,
                name: format!("app-{id}"),
                cpu,
                ..Default::default()
            })
            .collect(),
    }
}

fn methods(batch: &[Event]) -> Vec<&str> {
    batch.iter().map(|e| e.method.as_str()).collect()
}

#[test]
fn config_driven_history_stays_bounded_over_days() {
    let cfg = Config::from_yaml("graph:\n  datapoints: 100\n  distribution: [50, 30, 20]\n")
        .expect("config");
    let policy = cfg.graph.retention_policy();

    // Until a full day has passed since its last point, yesterday's run
    // still counts as age 0 and may keep today's share as well.
    let today = policy.target_for_age(0).map_or(0, |t| t.ceil() as usize);
    let bound = policy.budget + today + policy.distribution.len() + 2;

    let mut series = Series::new();
    let mut now = START;
    let mut max_len = 0;
    let mut compactions = 0;

    for i in 0..(4 * 24 * 60) {
        now = START + i * MINUTE;
        if series.compact(now, &policy) {
            compactions += 1;
        }
        series.append(((i * 37) % 101) as f64, now);
        max_len = max_len.max(series.len());
    }

    assert!(compactions > 0);
    assert!(max_len <= bound, "series grew to {max_len}, bound {bound}");
    assert_eq!(series.last().map(|p| p.x), Some(now));

    let cutoff = now - policy.distribution.max_age_ms();
    let compacted = resample(series.points(), now, &policy);
    assert!(!compacted.is_empty());
    assert!(compacted.iter().all(|p| p.x >= cutoff));
    assert!(compacted.windows(2).all(|w| w[0].x <= w[1].x));
}

#[test]
fn small_budget_keeps_latest_trend() {
    let cfg = Config::from_yaml("graph:\n  datapoints: 5\n  distribution: [100]\n").expect("config");
    let mut store = Store::new(cfg.graph.retention_policy(), cfg.logs.max);

    for (i, cpu) in [1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 1.0].into_iter().enumerate() {
        store.ingest(&snapshot(START + 12 * 60 * MINUTE + i as i64 * MINUTE, &[(0, cpu)]));
    }

    let cpu = &store
        .host("web-1")
        .and_then(|h| h.process(0))
        .expect("process")
        .usage
        .cpu;
    assert!(cpu.len() <= 5);
    let ys: Vec<f64> = cpu.points().iter().map(|p| p.y).collect();
    assert_eq!(ys.last(), Some(&1.0));
    assert!(ys.contains(&2.0));
}

#[tokio::test]
async fn removed_process_never_reappears_in_broadcasts() {
    let cfg = Config::default();
    let broadcaster = Arc::new(Broadcaster::default());
    let (handle, view, task) = worker::spawn(
        Store::new(cfg.graph.retention_policy(), cfg.logs.max),
        Arc::clone(&broadcaster),
        None,
        CancellationToken::new(),
    );

    let (sub, mut rx) = ChannelSubscriber::new("browser", 16);
    broadcaster.subscribe(Box::new(sub));

    handle
        .submit_sample(snapshot(START, &[(1, 10.0), (2, 20.0)]))
        .await
        .expect("round 1");
    handle
        .submit_sample(snapshot(START + 5_000, &[(1, 11.0)]))
        .await
        .expect("round 2");
    drop(handle);
    task.await.expect("worker");

    broadcaster.flush();
    let batch = rx.try_recv().expect("batch");
    assert_eq!(methods(&batch), vec!["onSystemData", "onSystemData"]);
    let round2 = &batch[1].args[0];
    assert_eq!(round2["processes"].as_array().map(Vec::len), Some(1));

    let (late, mut late_rx) = ChannelSubscriber::new("late", 4);
    broadcaster
        .subscribe_with_greeting(
            Box::new(late),
            vec![
                Event::config(&cfg.client_config()),
                Event::hosts(&view.load()),
            ],
        )
        .expect("greeting");

    let greeting = late_rx.try_recv().expect("greeting");
    let hosts = greeting[1].args[0].as_array().expect("hosts");
    let ids: Vec<u64> = hosts[0]["processes"]
        .as_array()
        .expect("processes")
        .iter()
        .filter_map(|p| p["id"].as_u64())
        .collect();
    assert_eq!(ids, vec![1]);
}

#[tokio::test]
async fn events_between_ticks_flush_as_one_batch() {
    let cfg = Config::default();
    let broadcaster = Arc::new(Broadcaster::default());
    let (handle, _view, task) = worker::spawn(
        Store::new(cfg.graph.retention_policy(), cfg.logs.max),
        Arc::clone(&broadcaster),
        None,
        CancellationToken::new(),
    );

    let (sub, mut rx) = ChannelSubscriber::new("browser", 16);
    broadcaster.subscribe(Box::new(sub));

    handle
        .submit_sample(snapshot(START, &[(1, 10.0)]))
        .await
        .expect("sample");
    handle
        .record_log("web-1", 1, LogKind::Info, "listening on :3000")
        .await
        .expect("log");
    handle
        .record_log("web-1", 1, LogKind::Error, "ECONNRESET")
        .await
        .expect("log");
    drop(handle);
    let store = task.await.expect("worker");

    let outcome = broadcaster.flush();
    assert_eq!(outcome.events, 3);

    let batch = rx.try_recv().expect("batch");
    assert_eq!(methods(&batch), vec!["onSystemData", "onInfoLog", "onErrorLog"]);
    assert_eq!(batch[2].args[2], "ECONNRESET");

    assert_eq!(broadcaster.flush().events, 0);
    assert!(rx.try_recv().is_err());

    let logs = &store.host("web-1").and_then(|h| h.process(1)).expect("process").logs;
    assert_eq!(logs.len(), 2);
}
