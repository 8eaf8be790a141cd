use anyhow::{Result, bail};
use evfix::merge::temp_path;
use evfix::testing::{ContainerBuilder, SummaryRow, int_column, sample_ntuple};
use evfix::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Writes a marker file at the output and remembers every call.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(usize, PathBuf)>>,
    fail_on: Option<String>,
}

impl Recorder {
    fn failing_on(name: &str) -> Self {
        Self { fail_on: Some(name.to_string()), ..Self::default() }
    }

    fn calls(&self) -> Vec<(usize, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

impl MergePrimitive for Recorder {
    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        self.calls.lock().unwrap().push((inputs.len(), output.to_path_buf()));
        let name = output.file_name().unwrap().to_string_lossy();
        if self.fail_on.as_deref() == Some(name.as_ref()) {
            std::fs::write(output, b"partial")?;
            bail!("simulated merge failure for {name}");
        }
        std::fs::write(output, inputs.len().to_string())?;
        Ok(())
    }
}

fn fake_inputs(dir: &Path, n: usize) -> Vec<PathBuf> {
    (0..n).map(|i| dir.join(format!("part_{i}.root"))).collect()
}

fn leftover_temps(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("tmp_"))
        .collect()
}

fn merger(primitive: Arc<dyn MergePrimitive>, fan_in: usize, jobs: usize) -> Result<HierarchicalMerger> {
    HierarchicalMerger::new(primitive, Arc::new(BundleStore::new()), fan_in, jobs)
}

#[test]
fn respects_fan_in_and_cleans_up() -> Result<()> {
    let tmp = TempDir::new()?;
    let out = tmp.path().join("merged.root");
    let rec = Arc::new(Recorder::default());

    let summary = merger(rec.clone(), 10, 1)?.merge(&fake_inputs(tmp.path(), 25), &out)?;

    assert_eq!(summary.calls_per_level, vec![3, 1]);
    let calls = rec.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|(n, _)| *n <= 10));
    assert_eq!(
        calls.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        vec![10, 10, 5, 3]
    );
    let first_level: Vec<_> = calls[..3].iter().map(|(_, p)| p.clone()).collect();
    assert_eq!(first_level, (0..3).map(|i| temp_path(&out, 1, i)).collect::<Vec<_>>());
    assert_eq!(calls[3].1, out);

    assert!(out.exists());
    assert!(leftover_temps(tmp.path()).is_empty());
    Ok(())
}

#[test]
fn small_inputs_take_a_single_call() -> Result<()> {
    let tmp = TempDir::new()?;
    let out = tmp.path().join("merged.root");
    let rec = Arc::new(Recorder::default());

    let summary = merger(rec.clone(), 10, 1)?.merge(&fake_inputs(tmp.path(), 10), &out)?;
    assert_eq!(summary.calls_per_level, vec![1]);
    assert_eq!(rec.calls(), vec![(10, out)]);
    Ok(())
}

#[test]
fn deep_trees_add_levels() -> Result<()> {
    let tmp = TempDir::new()?;
    let out = tmp.path().join("merged.root");
    let rec = Arc::new(Recorder::default());

    let summary = merger(rec.clone(), 2, 1)?.merge(&fake_inputs(tmp.path(), 9), &out)?;
    assert_eq!(summary.calls_per_level, vec![5, 3, 2, 1]);
    assert!(rec.calls().iter().all(|(n, _)| *n <= 2));
    assert!(leftover_temps(tmp.path()).is_empty());
    Ok(())
}

#[test]
fn failed_chunk_aborts_and_still_cleans_up() -> Result<()> {
    let tmp = TempDir::new()?;
    let out = tmp.path().join("merged.root");
    let rec = Arc::new(Recorder::failing_on("tmp_l1_001_merged.root"));

    let err = merger(rec.clone(), 10, 1)?
        .merge(&fake_inputs(tmp.path(), 25), &out)
        .unwrap_err();

    assert!(format!("{err:#}").contains("simulated merge failure"));
    assert_eq!(rec.calls().len(), 2);
    assert!(!out.exists());
    assert!(leftover_temps(tmp.path()).is_empty());
    Ok(())
}

#[test]
fn parallel_chunks_produce_the_same_plan() -> Result<()> {
    let tmp = TempDir::new()?;
    let out = tmp.path().join("merged.root");
    let rec = Arc::new(Recorder::default());

    let summary = merger(rec.clone(), 4, 3)?.merge(&fake_inputs(tmp.path(), 30), &out)?;
    assert_eq!(summary.calls_per_level, vec![8, 2, 1]);
    let mut sizes: Vec<usize> = rec.calls().iter().map(|(n, _)| *n).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![2, 2, 4, 4, 4, 4, 4, 4, 4, 4, 4]);
    assert!(leftover_temps(tmp.path()).is_empty());
    Ok(())
}

#[test]
fn invalid_parameters_are_rejected() -> Result<()> {
    let rec: Arc<dyn MergePrimitive> = Arc::new(Recorder::default());
    assert!(merger(rec.clone(), 1, 1).is_err());
    assert!(merger(rec.clone(), 10, 0).is_err());

    let tmp = TempDir::new()?;
    assert!(merger(rec, 10, 1)?.merge(&[], &tmp.path().join("m.root")).is_err());
    Ok(())
}

#[test]
fn container_merger_concatenates_tables_in_order() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(BundleStore::new());
    let a = sample_ntuple(store.as_ref(), tmp.path().join("a.root"), 1, 2)?;
    let b = sample_ntuple(store.as_ref(), tmp.path().join("b.root"), 2, 3)?;
    let out = tmp.path().join("ab.root");

    ContainerMerger::new(store.clone()).merge(&[a, b], &out)?;

    let reader = store.open(&out.to_string_lossy())?;
    let summary = reader.read_table("triggerAna/event_summary")?;
    assert_eq!(int_column(&summary, "run")?, vec![1, 1, 2, 2, 2]);
    assert_eq!(int_column(&summary, "event")?, vec![0, 1, 0, 1, 2]);
    assert_eq!(reader.read_table("triggerAna/TriggerPrimitives/tpmakerTPC")?.num_rows(), 10);
    assert_eq!(reader.read_record("triggerAna/info")?.as_deref(), Some(testing::SAMPLE_INFO));
    Ok(())
}

#[test]
fn container_merger_takes_first_record_and_unions_tables() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(BundleStore::new());
    let a = ContainerBuilder::new()
        .table("ns/left", &[SummaryRow::new(1, 1)])?
        .record("ns/info", b"first")
        .write(store.as_ref(), tmp.path().join("a.root"))?;
    let b = ContainerBuilder::new()
        .table("ns/right", &[SummaryRow::new(2, 2)])?
        .record("ns/info", b"second")
        .write(store.as_ref(), tmp.path().join("b.root"))?;
    let out = tmp.path().join("ab.root");

    ContainerMerger::new(store.clone()).merge(&[a, b], &out)?;

    let reader = store.open(&out.to_string_lossy())?;
    assert_eq!(reader.read_record("ns/info")?.as_deref(), Some(&b"first"[..]));
    assert_eq!(container::table_names(reader.as_ref(), "ns")?, vec!["left", "right"]);
    Ok(())
}

#[test]
fn container_merger_rejects_mismatched_schemas() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(BundleStore::new());
    let a = ContainerBuilder::new()
        .table("t", &[SummaryRow::new(1, 1)])?
        .write(store.as_ref(), tmp.path().join("a.root"))?;
    let b = ContainerBuilder::new()
        .table("t", &[testing::PrimitiveRow { run: 1, event: 1, channel: 3, samples_over_threshold: 9, adc_peak: 2 }])?
        .write(store.as_ref(), tmp.path().join("b.root"))?;

    let err = ContainerMerger::new(store.clone())
        .merge(&[a.clone(), b], &tmp.path().join("ab.root"))
        .unwrap_err();
    assert!(err.to_string().contains("does not match"));

    let err = ContainerMerger::new(store).merge(&[a.clone()], &a).unwrap_err();
    assert!(err.to_string().contains("also an input"));
    Ok(())
}

#[test]
fn real_containers_merge_over_two_levels() -> Result<()> {
    let tmp = TempDir::new()?;
    let store: Arc<dyn ContainerStore> = Arc::new(BundleStore::new());
    let inputs_dir = tmp.path().join("in");
    std::fs::create_dir(&inputs_dir)?;
    let inputs = (0..25)
        .map(|i| sample_ntuple(store.as_ref(), inputs_dir.join(format!("part_{i:02}.root")), i, 2))
        .collect::<Result<Vec<_>>>()?;
    let out = tmp.path().join("merged.root");

    let primitive = Arc::new(ContainerMerger::new(Arc::clone(&store)));
    let summary = HierarchicalMerger::new(primitive, Arc::clone(&store), 10, 1)?.merge(&inputs, &out)?;
    assert_eq!(summary.calls_per_level, vec![3, 1]);

    let reader = store.open(&out.to_string_lossy())?;
    let summary_table = reader.read_table("triggerAna/event_summary")?;
    assert_eq!(summary_table.num_rows(), 50);
    let runs = int_column(&summary_table, "run")?;
    assert_eq!(runs.first(), Some(&0));
    assert_eq!(runs.last(), Some(&24));
    assert!(runs.windows(2).all(|w| w[0] <= w[1]));
    assert!(leftover_temps(tmp.path()).is_empty());
    Ok(())
}

#[test]
fn inputs_named_like_temporaries_are_refused() -> Result<()> {
    let tmp = TempDir::new()?;
    let out = tmp.path().join("merged.root");
    let mut inputs = fake_inputs(tmp.path(), 11);
    let clash = temp_path(&out, 1, 0);
    std::fs::write(&clash, b"precious")?;
    inputs.push(clash.clone());
    let rec = Arc::new(Recorder::default());

    let err = merger(rec.clone(), 10, 1)?.merge(&inputs, &out).unwrap_err();
    assert!(err.to_string().contains("named like a temporary"));
    assert!(rec.calls().is_empty());
    assert_eq!(std::fs::read(&clash)?, b"precious");

    let elsewhere = tmp.path().join("other");
    std::fs::create_dir(&elsewhere)?;
    let summary = merger(rec.clone(), 10, 1)?.merge(&inputs, &elsewhere.join("merged.root"))?;
    assert_eq!(summary.calls_per_level, vec![2, 1]);
    assert_eq!(std::fs::read(&clash)?, b"precious");
    Ok(())
}
