use cache_utils::clock::{Clock, ManualClock};
use cache_utils::mmap::MMappedMemory;
use cache_utils::primitives::ScriptedPrimitives;
use cache_utils::probe::{ProbeConfig, ProbeMode};
use cache_utils::Address;
use contention::{ContentionError, ContentionSpec, Resource, ResourceParams};
use experiment::{ExperimentConfig, ExperimentError, ExperimentReport, ExperimentRunner, ProbeSpec};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

fn manual_clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(Duration::from_micros(1)))
}

fn short_bus(concurrency: u32) -> ContentionSpec {
    ContentionSpec::new(
        Duration::from_micros(50),
        concurrency,
        ResourceParams::MemoryBus {
            lock_offset: 3,
            lock_words: 16,
        },
    )
}

#[test]
fn scripted_hits_stay_below_noise_floor() {
    let page = MMappedMemory::<u64>::try_new_initialized(512, false, |i| i as u64).unwrap();
    let primitives = ScriptedPrimitives::new(vec![32, 36, 40, 34]).with_noise_floor(60);
    let config = ExperimentConfig {
        bin_width: 4,
        ..Default::default()
    };
    let runner = ExperimentRunner::new(primitives, manual_clock(), config).unwrap();
    let spec = unsafe { ProbeSpec::new(page.address(0).unwrap(), 1000) };

    let report = runner.run(Some(spec), Vec::new()).unwrap();

    assert_eq!(report.sample_set().len(), 1000);
    assert_eq!(report.bins().total(), 1000);
    assert_eq!(report.noise_floor(), 60);
    let mean = report.summary().mean().unwrap();
    assert!(mean < report.noise_floor() as f64);
    assert_eq!(report.summary().stats().unwrap().min, 32);
    assert_eq!(report.summary().stats().unwrap().max, 40);
    assert!(report.contention_specs_applied().is_empty());
}

#[test]
fn malformed_spec_does_not_abort_the_others() {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let destination = receiver.local_addr().unwrap();
    let nic = ContentionSpec::new(
        Duration::from_micros(50),
        1,
        ResourceParams::Nic {
            destination,
            packet_size: 64,
            target_bitrate: 128_000_000,
        },
    );
    let malformed = short_bus(0);
    let specs = vec![short_bus(2), malformed.clone(), nic.clone()];

    let target = 0u64;
    let runner = ExperimentRunner::new(
        ScriptedPrimitives::new(vec![200, 220]),
        manual_clock(),
        ExperimentConfig::default(),
    )
    .unwrap();
    let spec = unsafe { ProbeSpec::new(Address::of(&target), 100) };

    let Err(ExperimentError::PartialFailure {
        report,
        failed_specs,
    }) = runner.run(Some(spec), specs)
    else {
        panic!("expected a partial failure");
    };

    assert_eq!(failed_specs.len(), 1);
    assert_eq!(failed_specs[0].index, 1);
    assert_eq!(failed_specs[0].spec, malformed);
    assert!(matches!(
        failed_specs[0].error,
        ContentionError::InvalidSpec {
            field: "concurrency",
            ..
        }
    ));

    assert_eq!(report.contention_specs_applied(), &[short_bus(2), nic]);
    let generators = report.generators();
    assert_eq!(generators.len(), 2);
    assert_eq!(generators[0].resource, Resource::MemoryBus);
    assert_eq!(generators[0].units.len(), 2);
    assert!(generators[0].units.iter().all(|u| u.operations >= 16));
    assert_eq!(generators[1].resource, Resource::Nic);
    assert!(generators[1].units[0].steps >= 1);
    assert_eq!(report.sample_set().len(), 100);
}

#[test]
fn partial_report_is_reachable_through_the_error() {
    let runner = ExperimentRunner::new(
        ScriptedPrimitives::new(vec![1]),
        manual_clock(),
        ExperimentConfig::default(),
    )
    .unwrap();
    let mut zero_duration = short_bus(1);
    zero_duration.duration = Duration::ZERO;
    let err = runner.run(None, vec![zero_duration]).unwrap_err();
    let report = err.partial_report().unwrap();
    assert!(report.contention_specs_applied().is_empty());
    assert!(report.sample_set().is_empty());
    assert_eq!(err.to_string(), "1 contention spec(s) failed");
}

#[test]
fn report_survives_a_round_trip_to_disk() {
    let target = 0u64;
    let runner = ExperimentRunner::new(
        ScriptedPrimitives::new(vec![90, 300, 310]),
        manual_clock(),
        ExperimentConfig::default(),
    )
    .unwrap();
    let spec = unsafe { ProbeSpec::new(Address::of(&target), 30) };
    let report = runner.run(Some(spec), vec![short_bus(1)]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(format!("run.{}", ExperimentReport::EXTENSION_ZSTD));
    report.write_msgpack(&path).unwrap();
    let read = ExperimentReport::read_msgpack(&path).unwrap();
    assert_eq!(read, report);
    assert_eq!(read.bins().get(30), 10);
    assert_eq!(read.bins().get(31), 10);
}

#[cfg(target_arch = "x86_64")]
fn hardware_runner() -> ExperimentRunner<cache_utils::NativePrimitives> {
    let config = ExperimentConfig {
        probe: ProbeConfig {
            mode: ProbeMode::Reload,
            warm_delay: Duration::from_micros(20),
            noise_floor: None,
        },
        ..Default::default()
    };
    ExperimentRunner::native(config).unwrap()
}

#[cfg(target_arch = "x86_64")]
#[test]
#[ignore = "needs an idle x86_64 host"]
fn idle_reloads_hit_the_cache() {
    let page = MMappedMemory::<u64>::try_new_initialized(512, false, |i| i as u64).unwrap();
    let runner = hardware_runner();
    let spec = unsafe { ProbeSpec::new(page.address(0).unwrap(), 1000) };
    let report = runner.run(Some(spec), Vec::new()).unwrap();
    assert_eq!(report.sample_set().len(), 1000);
    assert!(report.summary().mean().unwrap() < report.noise_floor() as f64);
}

#[cfg(target_arch = "x86_64")]
#[test]
#[ignore = "needs an idle x86_64 host with at least two cores"]
fn llc_contention_slows_reloads_down() {
    let page = MMappedMemory::<u64>::try_new_initialized(512, false, |i| i as u64).unwrap();
    let runner = hardware_runner();
    let spec = unsafe { ProbeSpec::new(page.address(0).unwrap(), 1000) };

    let idle = runner.run(Some(spec), Vec::new()).unwrap();
    let loaded = runner
        .run(Some(spec), vec![ContentionSpec::cache(Duration::from_secs(2), 1)])
        .unwrap();

    let idle_mean = idle.summary().mean().unwrap();
    let loaded_mean = loaded.summary().mean().unwrap();
    assert!(
        loaded_mean > idle_mean,
        "idle {:.1}, under contention {:.1}",
        idle_mean,
        loaded_mean
    );
}
