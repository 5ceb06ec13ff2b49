use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::info;

use eddy_client::testing::{
    ok_result, status_result, MockClientFactory, MockConfigurationAdapter, MockNetworkClient,
};
use eddy_client::{ClientError, ClientOptions, EddyClient};
use eddy_core::model::{
    DataPoint, GetDataRequest, Key, KeyUpdateTime, ScanShardRequest, ScanShardResult, StatusCode,
};
use eddy_core::tool::setup_log;

fn reader_options() -> ClientOptions {
    ClientOptions {
        read_services_update_interval_secs: -1,
        ..Default::default()
    }
}

fn writer_options() -> ClientOptions {
    ClientOptions {
        writer_threads: 1,
        queue_capacity: 100_000,
        min_queue_size: 0,
        sleep_per_put_us: 1_000,
        retry_delay_secs: 0,
        write_retry_threads: 2,
        read_services_update_interval_secs: -1,
        ..Default::default()
    }
}

fn points(key: &str, shard_id: i64, n: usize) -> Vec<DataPoint> {
    (0..n)
        .map(|i| DataPoint::new(Key::new(key, shard_id), 1000 + i as i64, i as f64))
        .collect()
}

fn request(keys: &[(&str, i64)]) -> GetDataRequest {
    GetDataRequest {
        keys: keys.iter().map(|(name, shard)| Key::new(*name, *shard)).collect(),
        begin: 1000,
        end: 2000,
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_parallel_get_merges_across_services() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    east.script_get("a", vec![ok_result(1)]);
    east.script_get("b", vec![status_result(StatusCode::KeyMissing)]);
    east.script_get("c", vec![status_result(StatusCode::RpcFail)]);

    let west = Arc::new(MockNetworkClient::new("west"));
    west.script_get("a", vec![status_result(StatusCode::KeyMissing)]);
    west.script_get("b", vec![ok_result(2)]);
    west.script_get("c", vec![ok_result(3)]);

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east);
    factory.register(west);
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east", "west"]));

    // Strict mode: the merged answer is complete, so nothing throws.
    let client = EddyClient::new(adapter, factory, reader_options(), true)?;
    let result = client
        .future_get(&request(&[("a", 0), ("b", 1), ("c", 2)]), None)
        .await?;

    let names: Vec<&str> = result.results.iter().map(|r| r.key.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    for series in &result.results {
        assert_eq!(series.status, Some(StatusCode::Ok));
    }
    assert_eq!(result.results[0].blocks[0].data, vec![1; 4]);
    assert_eq!(result.results[1].blocks[0].data, vec![2; 4]);
    assert_eq!(result.results[2].blocks[0].data, vec![3; 4]);

    Ok(())
}

#[tokio::test]
async fn test_sequential_get_invalidates_and_retries() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    east.script_get("a", vec![status_result(StatusCode::DontOwnShard), ok_result(5)]);
    east.script_get("b", vec![ok_result(6)]);

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east.clone());
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east"]));

    let client = EddyClient::new(adapter, factory, reader_options(), false)?;
    let outcome = client.get(&request(&[("a", 3), ("b", 1)]), None).await?;

    // Both keys resolve within the single service: b on the first round, a
    // on the retry after the shard cache was invalidated.
    let names: Vec<&str> = outcome.keys.iter().map(|k| k.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);
    assert!(outcome.results.iter().all(|r| r.status == StatusCode::Ok));

    let invalidations = east.invalidations();
    assert_eq!(invalidations.len(), 1);
    assert!(invalidations[0].contains(&3));
    assert_eq!(east.get_calls(), 2);
    assert_eq!(client.stats().snapshot().read_failover, 0);

    Ok(())
}

#[tokio::test]
async fn test_transient_failure_everywhere() -> Result<()> {
    setup_log();

    let factory = Arc::new(MockClientFactory::new());
    for name in ["east", "west", "north"] {
        let mock = Arc::new(MockNetworkClient::new(name));
        mock.script_get("a", vec![status_result(StatusCode::RpcFail)]);
        mock.script_get("b", vec![ok_result(1)]);
        factory.register(mock);
    }
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east", "west", "north"]));

    // Strict: both read forms fail.
    let strict = EddyClient::new(adapter.clone(), factory.clone(), reader_options(), true)?;
    let req = request(&[("a", 0), ("b", 1)]);

    let err = strict.get(&req, None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::TransientFailure { .. })
    ));
    assert!(strict.stats().snapshot().read_failover >= 2);

    let err = strict.future_get(&req, None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::TransientFailure { .. })
    ));

    // Non-strict: the bad key comes back as an empty series.
    let lax = EddyClient::new(adapter, factory, reader_options(), false)?;
    let result = lax.future_get(&req, None).await?;
    assert_eq!(result.results[0].status, Some(StatusCode::RpcFail));
    assert!(result.results[0].blocks.is_empty());
    assert_eq!(result.results[1].status, Some(StatusCode::Ok));

    let outcome = lax.get(&req, None).await?;
    let names: Vec<&str> = outcome.keys.iter().map(|k| k.name.as_str()).collect();
    assert_eq!(names, vec!["b"]);

    Ok(())
}

#[tokio::test]
async fn test_put_and_retry_after_failed_send() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    east.fail_next_puts(1);

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east.clone());
    let adapter = Arc::new(MockConfigurationAdapter::new(&[]));
    adapter.set_write_services(&["east"]);

    let client = EddyClient::new(adapter, factory, writer_options(), false)?;
    assert!(client.put_data_points(points("cpu.idle", 2, 10)));

    // The first send fails wholesale, the batch takes the retry path and
    // the second send lands.
    wait_until(|| east.accepted_points().len() == 10, "retried points to land").await;
    assert!(east.put_calls() >= 2);

    let snapshot = client.stats().snapshot();
    let east_stats = snapshot.service("east").unwrap();
    assert_eq!(east_stats.enqueued, 10);
    assert_eq!(east_stats.put_retry, 10);
    assert_eq!(east_stats.put, 10);
    assert_eq!(snapshot.retry_queue_size, 0);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stale_retry_is_discarded() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    east.fail_next_puts(1);

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east.clone());
    let adapter = Arc::new(MockConfigurationAdapter::new(&[]));
    adapter.set_write_services(&["east"]);

    // A send time far enough in the past is beyond the staleness threshold
    // by the time the pump sees it.
    let mut options = writer_options();
    options.retry_delay_secs = -120;

    let client = EddyClient::new(adapter, factory, options, false)?;
    client.put_data_points(points("cpu.idle", 2, 10));

    wait_until(
        || client.stats().snapshot().service("east").map(|s| s.put_dropped) == Some(10),
        "stale batch to be dropped",
    )
    .await;

    assert_eq!(east.accepted_points().len(), 0);
    assert_eq!(east.put_calls(), 1);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_flush_queue_delivers_everything() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    let factory = Arc::new(MockClientFactory::new());
    factory.register(east.clone());
    let adapter = Arc::new(MockConfigurationAdapter::new(&[]));
    adapter.set_write_services(&["east"]);

    let mut options = writer_options();
    options.writer_threads = 2;

    let client = EddyClient::new(adapter, factory, options, false)?;
    for _ in 0..3 {
        assert!(client.put_data_points(points("net.rx", 1, 100)));
    }

    client.flush_queue().await;
    assert_eq!(east.accepted_points().len(), 300);

    // Workers restarted with the configured count; the pipeline keeps
    // accepting.
    assert!(client.put_data_points(points("net.rx", 1, 50)));
    client.flush_queue().await;
    assert_eq!(east.accepted_points().len(), 350);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_parallel_and_sequential_agree_single_service() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    east.script_get("a", vec![ok_result(7)]);
    east.script_get("b", vec![status_result(StatusCode::KeyMissing)]);

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east);
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east"]));

    let client = EddyClient::new(adapter, factory, reader_options(), false)?;
    let req = request(&[("a", 0), ("b", 1)]);

    let outcome = client.get(&req, None).await?;
    let result = client.future_get(&req, None).await?;

    // Same resolved keys, same payloads.
    assert_eq!(outcome.keys.len(), 1);
    assert_eq!(outcome.keys[0].name, "a");
    assert_eq!(result.results[0].status, Some(StatusCode::Ok));
    assert_eq!(outcome.results[0].data, result.results[0].blocks);
    assert_eq!(result.results[1].status, Some(StatusCode::KeyMissing));
    assert!(result.results[1].blocks.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_one_complete_arms_grace_window() -> Result<()> {
    setup_log();

    let fast = Arc::new(MockNetworkClient::new("fast").with_timeout_ms(100));
    let slow = Arc::new(
        MockNetworkClient::new("slow")
            .with_timeout_ms(100)
            .with_rpc_delay_ms(1500),
    );

    let factory = Arc::new(MockClientFactory::new());
    factory.register(fast);
    factory.register(slow);
    let adapter = Arc::new(MockConfigurationAdapter::new(&["fast", "slow"]));

    let client = EddyClient::new(adapter, factory, reader_options(), false)?;

    let start = Instant::now();
    let result = client
        .future_get(&request(&[("a", 0), ("b", 1)]), None)
        .await?;
    let elapsed = start.elapsed();

    info!("grace window read resolved in {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000));
    assert!(result.results.iter().all(|r| r.status == Some(StatusCode::Ok)));

    Ok(())
}

#[tokio::test]
async fn test_service_override() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    let north = Arc::new(MockNetworkClient::new("north"));

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east.clone());
    factory.register(north.clone());
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east"]));

    let client = EddyClient::new(adapter.clone(), factory.clone(), reader_options(), false)?;

    // A valid service outside the snapshot gets a temporary client.
    client
        .future_get(&request(&[("a", 0)]), Some("north"))
        .await?;
    assert!(north.get_calls() > 0);
    assert_eq!(east.get_calls(), 0);
    assert!(factory.created().iter().any(|s| s == "north"));

    // An invalid override is counted and the full snapshot is used.
    adapter.set_invalid("bogus");
    client
        .future_get(&request(&[("a", 0)]), Some("bogus"))
        .await?;
    assert!(east.get_calls() > 0);
    assert!(client.stats().snapshot().bad_read_services >= 1);

    Ok(())
}

#[tokio::test]
async fn test_get_last_update_times_stops_on_callback() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    east.set_update_times(
        (1..=5)
            .map(|i| KeyUpdateTime {
                key: format!("key{}", i),
                shard_id: i,
                update_time: i,
            })
            .collect(),
    );

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east);
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east"]));

    let client = EddyClient::new(adapter, factory, reader_options(), false)?;

    let mut seen = Vec::new();
    let mut callback = |page: &[KeyUpdateTime]| {
        seen.extend(page.iter().map(|t| t.key.clone()));
        false
    };
    client.get_last_update_times(2, 2, 10, &mut callback).await?;

    // One page of two, then the callback stopped the enumeration.
    assert_eq!(seen, vec!["key2", "key3"]);

    Ok(())
}

#[tokio::test]
async fn test_shadow_only_put_reports_failure() -> Result<()> {
    setup_log();

    let shade = Arc::new(MockNetworkClient::new("shade").with_shadow());
    let factory = Arc::new(MockClientFactory::new());
    factory.register(shade.clone());
    let adapter = Arc::new(MockConfigurationAdapter::new(&[]));
    adapter.set_shadow_services(&["shade"]);

    let client = EddyClient::new(adapter, factory, writer_options(), false)?;

    // The shadow pipeline takes the points, but its acceptance does not
    // count toward availability.
    assert!(!client.put_data_points(points("cpu.idle", 0, 5)));
    wait_until(|| shade.accepted_points().len() == 5, "shadow points to land").await;
    assert_eq!(
        client.stats().snapshot().service("shade").unwrap().enqueued,
        5
    );

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_write_and_shadow_services_share_the_batch() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    let shade = Arc::new(MockNetworkClient::new("shade").with_shadow());

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east.clone());
    factory.register(shade.clone());
    let adapter = Arc::new(MockConfigurationAdapter::new(&[]));
    adapter.set_write_services(&["east"]);
    adapter.set_shadow_services(&["shade"]);

    let client = EddyClient::new(adapter, factory, writer_options(), false)?;
    assert!(client.put_data_points(points("mem.free", 1, 20)));

    wait_until(
        || east.accepted_points().len() == 20 && shade.accepted_points().len() == 20,
        "both services to receive the batch",
    )
    .await;

    assert_eq!(client.get_num_shards_from_write_client(), 4);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_registry_refresh_through_facade() -> Result<()> {
    setup_log();

    let factory = Arc::new(MockClientFactory::new());
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east"]));

    let client = EddyClient::new(adapter.clone(), factory, reader_options(), false)?;
    assert_eq!(client.registry().snapshot().len(), 1);

    // Empty refresh is a no-op, a bad entry is skipped and counted.
    adapter.set_read_services(&[]);
    client.update_read_services();
    assert_eq!(client.registry().snapshot().len(), 1);

    adapter.set_read_services(&["bogus", "east", "west"]);
    adapter.set_invalid("bogus");
    client.update_read_services();

    let snapshot = client.registry().snapshot();
    let names: Vec<&str> = snapshot.iter().map(|c| c.service_name()).collect();
    assert_eq!(names, vec!["east", "west"]);
    assert_eq!(client.stats().snapshot().bad_read_services, 1);

    Ok(())
}

#[tokio::test]
async fn test_scan_shard_prefers_first_service() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    let full = ScanShardResult {
        status: StatusCode::Ok,
        keys: vec!["a".to_string(), "b".to_string()],
        data: vec![Vec::new(), Vec::new()],
    };
    east.set_scan_result(full.clone());

    let west = Arc::new(MockNetworkClient::new("west"));
    west.set_scan_result(ScanShardResult::empty(StatusCode::StorageFail));

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east);
    factory.register(west);
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east", "west"]));

    let client = EddyClient::new(adapter, factory, reader_options(), false)?;

    let request = ScanShardRequest {
        shard_id: 1,
        begin: 0,
        end: 100,
    };
    assert_eq!(client.scan_shard(&request).await?, full);
    assert_eq!(client.future_scan_shard(&request, None).await?, full);

    Ok(())
}

#[tokio::test]
async fn test_parallel_scan_shard_takes_best_copy() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    east.set_scan_result(ScanShardResult::empty(StatusCode::ShardInProgress));

    let west = Arc::new(MockNetworkClient::new("west"));
    let full = ScanShardResult {
        status: StatusCode::Ok,
        keys: vec!["a".to_string()],
        data: vec![Vec::new()],
    };
    west.set_scan_result(full.clone());

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east);
    factory.register(west);
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east", "west"]));

    let mut options = reader_options();
    options.parallel_scan_shard = true;

    let client = EddyClient::new(adapter, factory, options, false)?;
    let request = ScanShardRequest {
        shard_id: 1,
        begin: 0,
        end: 100,
    };
    assert_eq!(client.future_scan_shard(&request, None).await?, full);

    Ok(())
}

#[tokio::test]
async fn test_protocol_violation_is_typed() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    east.script_get("a", vec![status_result(StatusCode::BucketNotFinalized)]);

    let factory = Arc::new(MockClientFactory::new());
    factory.register(east);
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east"]));

    let client = EddyClient::new(adapter, factory, reader_options(), false)?;
    let req = request(&[("a", 0)]);

    for err in [
        client.get(&req, None).await.unwrap_err(),
        client.future_get(&req, None).await.unwrap_err(),
    ] {
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::ProtocolViolation)
        ));
    }

    Ok(())
}

#[tokio::test]
async fn test_refresh_loop_picks_up_new_services() -> Result<()> {
    setup_log();

    let factory = Arc::new(MockClientFactory::new());
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east"]));

    let mut options = reader_options();
    options.read_services_update_interval_secs = 1;

    let client = EddyClient::new(adapter.clone(), factory, options, false)?;
    assert_eq!(client.registry().snapshot().len(), 1);

    adapter.set_read_services(&["east", "west"]);
    wait_until(|| client.registry().snapshot().len() == 2, "refresh to pick up west").await;

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_requests_reaches_first_service() -> Result<()> {
    setup_log();

    let east = Arc::new(MockNetworkClient::new("east"));
    let factory = Arc::new(MockClientFactory::new());
    factory.register(east.clone());
    let adapter = Arc::new(MockConfigurationAdapter::new(&["east"]));

    let client = EddyClient::new(adapter, factory, reader_options(), false)?;
    client.stop_requests();
    assert!(east.is_stopped());

    Ok(())
}
