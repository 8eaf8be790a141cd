use anyhow::Result;
use evfix::testing::{SAMPLE_INFO, SummaryRow, ContainerBuilder, int_column, sample_ntuple};
use evfix::*;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn transformer(outdir: &Path, spec: TransformSpec, renumber: bool, naming: OutputNaming) -> RecordTransformer {
    RecordTransformer::new(
        Arc::new(BundleStore::new()),
        Arc::new(PipelineConfig::default()),
        TransformPlan { spec, renumber, naming, outdir: outdir.to_path_buf() },
    )
}

fn input(dir: &Path, name: &str, pattern: KeyPattern, run: u32, events: u32) -> Result<InputDescriptor> {
    let path = sample_ntuple(&BundleStore::new(), dir.join(name), run, events)?;
    let d = discover(&[path], pattern, &[]);
    Ok(d.accepted.into_values().next().expect("fixture name matches"))
}

#[test]
fn job_renumbering_offsets_every_table() -> Result<()> {
    let tmp = TempDir::new()?;
    let outdir = tmp.path().join("out");
    let input = input(tmp.path(), "run1_3_ana.ntuple.root", KeyPattern::Job, 1, 4)?;

    let out = transformer(&outdir, TransformSpec::identity(), true, OutputNaming::Fixed).transform(&input)?;
    assert_eq!(out, outdir.join("run1_3_evfix_ana.ntuple.root"));

    let reader = BundleStore::new().open(&out.to_string_lossy())?;
    let summary = reader.read_table("triggerAna/event_summary")?;
    assert_eq!(int_column(&summary, "event")?, vec![30, 31, 32, 33]);
    assert_eq!(int_column(&summary, "run")?, vec![1, 1, 1, 1]);

    let tps = reader.read_table("triggerAna/TriggerPrimitives/tpmakerTPC")?;
    assert_eq!(int_column(&tps, "event")?, vec![30, 30, 31, 31, 32, 32, 33, 33]);
    assert_eq!(tps.num_rows(), 8);

    let names: Vec<String> = evfix::container::table_names(reader.as_ref(), "triggerAna")?;
    assert_eq!(names, vec!["event_summary", "mctruths"]);
    Ok(())
}

#[test]
fn run_job_renumbering_overwrites_run() -> Result<()> {
    let tmp = TempDir::new()?;
    let outdir = tmp.path().join("out");
    let input = input(tmp.path(), "sim_42_2_ana.ntuple.root", KeyPattern::RunJob, 999, 3)?;

    let out = transformer(&outdir, TransformSpec::identity(), true, OutputNaming::Fixed).transform(&input)?;
    assert_eq!(out, outdir.join("sim_42_2_evfix_ana.ntuple.root"));

    let reader = BundleStore::new().open(&out.to_string_lossy())?;
    for table in ["triggerAna/event_summary", "triggerAna/TriggerPrimitives/tpmakerTPCSimpleThreshold"] {
        let batch = reader.read_table(table)?;
        assert!(int_column(&batch, "run")?.iter().all(|&r| r == 42), "{table}");
        assert!(int_column(&batch, "event")?.iter().all(|&e| (20..23).contains(&e)), "{table}");
    }
    Ok(())
}

#[test]
fn metadata_is_carried_verbatim() -> Result<()> {
    let tmp = TempDir::new()?;
    let input = input(tmp.path(), "run1_0_ana.ntuple.root", KeyPattern::Job, 1, 2)?;
    let out = transformer(&tmp.path().join("out"), TransformSpec::identity(), true, OutputNaming::Fixed)
        .transform(&input)?;

    let reader = BundleStore::new().open(&out.to_string_lossy())?;
    assert_eq!(reader.read_record("triggerAna/info")?.as_deref(), Some(SAMPLE_INFO));
    Ok(())
}

#[test]
fn missing_metadata_is_tolerated() -> Result<()> {
    let tmp = TempDir::new()?;
    let store = BundleStore::new();
    let rows: Vec<SummaryRow> = (0..3).map(|e| SummaryRow::new(5, e)).collect();
    let path = ContainerBuilder::new()
        .table("triggerAna/event_summary", &rows)?
        .write(&store, tmp.path().join("bare_1_ana.ntuple.root"))?;
    let d = discover(&[path], KeyPattern::Job, &[]);
    let input = &d.accepted[&PartitionKey::job(1)];

    let out = transformer(&tmp.path().join("out"), TransformSpec::identity(), true, OutputNaming::Fixed)
        .transform(input)?;
    let reader = store.open(&out.to_string_lossy())?;
    assert_eq!(reader.read_record("triggerAna/info")?, None);
    assert_eq!(int_column(&reader.read_table("triggerAna/event_summary")?, "event")?, vec![10, 11, 12]);
    Ok(())
}

#[test]
fn slimming_masks_tables_adds_uid_and_cuts_primitives() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = sample_ntuple(&BundleStore::new(), tmp.path().join("bkg.ntuple.root"), 7, 3)?;
    let d = enumerate_inputs(&[path], &[]);
    let input = &d.accepted[&PartitionKey::job(0)];

    let outdir = tmp.path().join("slim");
    let out = transformer(&outdir, TransformSpec::slim(SlimMode::Bkg)?, false, OutputNaming::Slim).transform(input)?;
    assert_eq!(out, outdir.join("bkg.ntuple.root"));

    let reader = BundleStore::new().open(&out.to_string_lossy())?;
    assert_eq!(evfix::container::table_names(reader.as_ref(), "triggerAna")?, vec!["event_summary"]);

    let summary = reader.read_table("triggerAna/event_summary")?;
    assert_eq!(int_column(&summary, "event")?, vec![0, 1, 2]);
    assert_eq!(int_column(&summary, "event_uid")?, vec![700_000, 700_001, 700_002]);
    assert_eq!(
        summary.schema().field_with_name("event_uid")?.data_type(),
        &arrow::datatypes::DataType::UInt64
    );

    let tps = reader.read_table("triggerAna/TriggerPrimitives/tpmakerTPC")?;
    assert_eq!(tps.num_rows(), 3);
    assert!(int_column(&tps, "samples_over_threshold")?.iter().all(|&s| s > 7));
    assert_eq!(int_column(&tps, "event_uid")?, vec![700_000, 700_001, 700_002]);
    assert_eq!(reader.read_record("triggerAna/info")?.as_deref(), Some(SAMPLE_INFO));
    Ok(())
}

#[test]
fn uid_bound_is_enforced() -> Result<()> {
    let tmp = TempDir::new()?;
    let rows = vec![SummaryRow::new(1, 99_999), SummaryRow::new(1, 100_000)];
    let path = ContainerBuilder::new()
        .table("triggerAna/event_summary", &rows)?
        .write(&BundleStore::new(), tmp.path().join("big.ntuple.root"))?;
    let d = enumerate_inputs(&[path], &[]);

    let err = transformer(&tmp.path().join("slim"), TransformSpec::slim(SlimMode::Nu)?, false, OutputNaming::Slim)
        .transform(&d.accepted[&PartitionKey::job(0)])
        .unwrap_err();
    assert!(matches!(err, JobError::Transform(_)));
    assert!(err.to_string().contains("event_uid"));
    Ok(())
}

#[test]
fn rerun_produces_identical_rows() -> Result<()> {
    let tmp = TempDir::new()?;
    let outdir = tmp.path().join("out");
    let input = input(tmp.path(), "run1_4_ana.ntuple.root", KeyPattern::Job, 1, 5)?;
    let t = transformer(&outdir, TransformSpec::identity(), true, OutputNaming::Fixed);

    let first = t.transform(&input)?;
    let before = BundleStore::new().open(&first.to_string_lossy())?.read_table("triggerAna/mctruths")?;
    let second = t.transform(&input)?;
    let after = BundleStore::new().open(&second.to_string_lossy())?.read_table("triggerAna/mctruths")?;

    assert_eq!(first, second);
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn unreadable_input_is_an_open_failure_without_output() -> Result<()> {
    let tmp = TempDir::new()?;
    let bogus = tmp.path().join("run1_9_ana.ntuple.root");
    std::fs::write(&bogus, b"not a container")?;
    let d = discover(&[&bogus], KeyPattern::Job, &[]);
    let outdir = tmp.path().join("out");

    let err = transformer(&outdir, TransformSpec::identity(), true, OutputNaming::Fixed)
        .transform(&d.accepted[&PartitionKey::job(9)])
        .unwrap_err();
    assert!(matches!(err, JobError::Open(_)));
    assert!(!outdir.join("run1_9_evfix_ana.ntuple.root").exists());
    Ok(())
}

#[test]
fn aliased_outdir_never_replaces_the_input() -> Result<()> {
    let tmp = TempDir::new()?;
    let data = tmp.path().join("data");
    std::fs::create_dir(&data)?;
    let path = sample_ntuple(&BundleStore::new(), data.join("bkg.ntuple.root"), 7, 3)?;
    let d = enumerate_inputs(&[&path], &[]);

    for outdir in [tmp.path().join("sub/../data"), data.join(".")] {
        let err = transformer(&outdir, TransformSpec::slim(SlimMode::Bkg)?, false, OutputNaming::Slim)
            .transform(&d.accepted[&PartitionKey::job(0)])
            .unwrap_err();
        assert!(matches!(err, JobError::Transform(_)));
        assert!(err.to_string().contains("overwrite its own input"));
    }

    let reader = BundleStore::new().open(&path.to_string_lossy())?;
    assert_eq!(int_column(&reader.read_table("triggerAna/event_summary")?, "event")?, vec![0, 1, 2]);
    assert_eq!(reader.read_record("triggerAna/info")?.as_deref(), Some(SAMPLE_INFO));
    Ok(())
}

#[test]
fn offsets_that_overflow_the_event_type_fail_the_job() -> Result<()> {
    use arrow::array::{ArrayRef, UInt32Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    let tmp = TempDir::new()?;
    let schema = Schema::new(vec![
        Field::new("run", DataType::UInt32, true),
        Field::new("event", DataType::UInt32, true),
    ]);
    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt32Array::from(vec![Some(1), Some(1), Some(1)])),
        Arc::new(UInt32Array::from(vec![Some(0), Some(1), Some(2)])),
    ];
    let batch = RecordBatch::try_new(Arc::new(schema), columns)?;
    let path = ContainerBuilder::new()
        .batch("triggerAna/event_summary", batch)
        .write(&BundleStore::new(), tmp.path().join("wide_500000000_ana.ntuple.root"))?;
    let d = discover(&[path], KeyPattern::Job, &[]);

    let err = transformer(&tmp.path().join("out"), TransformSpec::identity(), true, OutputNaming::Fixed)
        .transform(&d.accepted[&PartitionKey::job(500_000_000)])
        .unwrap_err();
    assert!(matches!(err, JobError::Transform(_)));
    assert!(err.to_string().contains("event"));
    Ok(())
}
