use anyhow::Result;
use evfix::testing::sample_ntuple;
use evfix::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

fn descriptors(n: u64) -> BTreeMap<PartitionKey, InputDescriptor> {
    let names: Vec<String> = (0..n).map(|j| format!("batch_{j}_ana.ntuple.root")).collect();
    discover(&names, KeyPattern::Job, &[]).accepted
}

#[test]
fn one_unreadable_input_fails_alone() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = BundleStore::new();
    let mut paths = Vec::new();
    for job in 0..6 {
        paths.push(sample_ntuple(&store, tmp.path().join(format!("run1_{job}_ana.ntuple.root")), 1, 3)?);
    }
    let broken = tmp.path().join("run1_6_ana.ntuple.root");
    std::fs::write(&broken, b"garbage")?;
    paths.push(broken);

    let discovery = discover(&paths, KeyPattern::Job, &[]);
    let transformer = RecordTransformer::new(
        Arc::new(store),
        Arc::new(PipelineConfig::default()),
        TransformPlan {
            spec: TransformSpec::identity(),
            renumber: true,
            naming: OutputNaming::Fixed,
            outdir: tmp.path().join("out"),
        },
    );

    let mut seen = 0;
    let outcomes = Scheduler::new(3).run(Arc::new(transformer), &discovery.accepted, |_| seen += 1)?;

    assert_eq!(seen, 7);
    assert_eq!(outcomes.len(), 7);
    let failed: Vec<_> = outcomes.values().filter(|o| !o.is_success()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, PartitionKey::job(6));
    assert!(matches!(failed[0].result, JobResult::Failed(JobError::Open(_))));
    assert!(outcomes.values().filter_map(JobOutcome::output).all(|p| p.exists()));
    Ok(())
}

#[test]
fn panicking_job_is_isolated() -> Result<()> {
    let inputs = descriptors(8);
    let job = |input: &InputDescriptor| -> Result<PathBuf, JobError> {
        if input.key.job == 3 {
            panic!("corrupt basket in job 3");
        }
        Ok(PathBuf::from(format!("out/{}", input.key.job)))
    };

    let outcomes = Scheduler::new(2).run(Arc::new(job), &inputs, |_| {})?;
    assert_eq!(outcomes.len(), 8);
    match &outcomes[&PartitionKey::job(3)].result {
        JobResult::Failed(JobError::Panicked(msg)) => assert!(msg.contains("corrupt basket")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(outcomes.values().filter(|o| o.is_success()).count(), 7);
    Ok(())
}

#[test]
fn single_worker_processes_everything() -> Result<()> {
    let inputs = descriptors(20);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let job = move |input: &InputDescriptor| -> Result<PathBuf, JobError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from(input.key.file_tag()))
    };

    let outcomes = Scheduler::new(1).run(Arc::new(job), &inputs, |_| {})?;
    assert_eq!(calls.load(Ordering::SeqCst), 20);
    assert!(outcomes.iter().all(|(k, o)| o.output() == Some(&PathBuf::from(k.file_tag()))));
    Ok(())
}

#[test]
fn hung_jobs_surface_as_timed_out() -> Result<()> {
    let inputs = descriptors(3);
    let job = |input: &InputDescriptor| -> Result<PathBuf, JobError> {
        if input.key.job == 1 {
            std::thread::sleep(Duration::from_secs(3));
        }
        Ok(PathBuf::from("done"))
    };

    let outcomes = Scheduler::new(3)
        .with_timeout(Some(Duration::from_millis(500)))
        .run(Arc::new(job), &inputs, |_| {})?;

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[&PartitionKey::job(1)].result, JobResult::TimedOut));
    assert!(outcomes[&PartitionKey::job(0)].is_success());
    assert!(outcomes[&PartitionKey::job(2)].is_success());

    let discovery = Discovery { accepted: inputs, ..Discovery::default() };
    let report = BatchReport::new(&discovery, &outcomes, Duration::from_millis(500));
    assert_eq!(report.timed_out, vec!["1".to_string()]);
    assert_eq!(report.failure_count(), 1);
    Ok(())
}

#[test]
fn report_aggregates_outcomes() -> Result<()> {
    let names = vec!["a_1_ana.ntuple.root", "a_2_ana.ntuple.root", "junk.root"];
    let discovery = discover(&names, KeyPattern::Job, &[]);
    let job = |input: &InputDescriptor| -> Result<PathBuf, JobError> {
        if input.key.job == 2 {
            return Err(JobError::Transform(anyhow::anyhow!("bad column")));
        }
        Ok(PathBuf::from("a_1_evfix_ana.ntuple.root"))
    };
    let outcomes = Scheduler::new(2).run(Arc::new(job), &discovery.accepted, |_| {})?;

    let report = BatchReport::new(&discovery, &outcomes, Duration::from_millis(10));
    assert_eq!(report.accepted, 2);
    assert_eq!(report.no_match, vec![PathBuf::from("junk.root")]);
    assert_eq!(report.failure_count(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].partition, "2");
    assert_eq!(report.failed[0].kind, FailureKind::Transform);
    assert_eq!(report.outputs(), vec![PathBuf::from("a_1_evfix_ana.ntuple.root")]);

    let json = serde_json::to_value(&report)?;
    assert_eq!(json["failed"][0]["partition"], "2");
    assert_eq!(json["failed"][0]["kind"], "transform");
    Ok(())
}

#[test]
fn report_lists_partitions_numerically() -> Result<()> {
    let names: Vec<String> = [10, 2, 9, 100]
        .iter()
        .map(|j| format!("a_{j}_ana.ntuple.root"))
        .collect();
    let discovery = discover(&names, KeyPattern::Job, &[]);
    let job = |input: &InputDescriptor| -> Result<PathBuf, JobError> {
        if input.key.job % 2 == 1 {
            return Err(JobError::Transform(anyhow::anyhow!("odd job")));
        }
        Ok(PathBuf::from(format!("out_{}", input.key.job)))
    };
    let outcomes = Scheduler::new(4).run(Arc::new(job), &discovery.accepted, |_| {})?;
    let report = BatchReport::new(&discovery, &outcomes, Duration::ZERO);

    let done: Vec<&str> = report.succeeded.iter().map(|c| c.partition.as_str()).collect();
    assert_eq!(done, vec!["2", "10", "100"]);
    assert_eq!(
        report.outputs(),
        vec![PathBuf::from("out_2"), PathBuf::from("out_10"), PathBuf::from("out_100")]
    );
    assert_eq!(report.failed[0].partition, "9");

    let json = serde_json::to_value(&report)?;
    let listed: Vec<&str> = json["succeeded"]
        .as_array()
        .map(|a| a.iter().filter_map(|c| c["partition"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(listed, vec!["2", "10", "100"]);
    Ok(())
}
