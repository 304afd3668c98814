// End-to-end runs of the fetch / statistics / logger pipeline over temporary directories

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};
    use pinned_pipeline::stages::ImageStatistics;
    use pinned_pipeline::sweep::{run_sweep_with_affinity, write_results, SweepConfig};
    use pinned_pipeline::threading::NoAffinity;
    use pinned_pipeline::{
        CommunicationMode, ConfigError, CoreAssignment, DispatchPolicy, Pipeline, PipelineConfig,
        PipelineError, WorkerPhase,
    };
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Temp tree with `count` 8x8 PNGs plus a file that must be ignored.
    ///
    /// Each image is transparent except for one opaque pixel inside its top-left quarter and
    /// one outside it, so the cropped character is always a single pixel.
    fn input_tree(count: usize) -> TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let images = tmp.path().join("bin");
        fs::create_dir_all(images.join("nested")).unwrap();
        for i in 0..count {
            let dir = if i % 2 == 0 { images.clone() } else { images.join("nested") };
            let shade = (i * 40) as u8;
            let mut image = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0]));
            image.put_pixel(1, 0, Rgba([shade, shade, shade, 255]));
            image.put_pixel(6, 6, Rgba([255, 0, 0, 255]));
            image.save(dir.join(format!("img{i}.png"))).unwrap();
        }
        fs::write(images.join("README.md"), b"not an image").unwrap();
        tmp
    }

    fn config(root: &Path, mode: CommunicationMode, policy: DispatchPolicy) -> PipelineConfig {
        PipelineConfig {
            mode,
            policy,
            input_dir: root.join("bin"),
            output_file: Some(root.join("results.csv")),
            work_dir: root.join("work"),
            cores: CoreAssignment {
                dispatcher: 0,
                fetcher: 0,
                statistics: 1,
                logger: 2,
            },
            stop_backoff_ms: 1,
            ..PipelineConfig::default()
        }
    }

    fn read_results(path: &Path) -> Vec<csv::StringRecord> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, ImageStatistics::COLUMNS);
        reader.records().map(Result::unwrap).collect()
    }

    fn column(row: &csv::StringRecord, name: &str) -> String {
        let index = ImageStatistics::COLUMNS
            .iter()
            .position(|column| *column == name)
            .unwrap();
        row[index].to_string()
    }

    #[test]
    fn test_every_mode_and_policy_processes_all_inputs() {
        for mode in CommunicationMode::ALL {
            for policy in DispatchPolicy::ALL {
                let tmp = input_tree(4);
                let config = config(tmp.path(), mode, policy);

                let report = Pipeline::run_with_affinity(&config, Arc::new(NoAffinity)).unwrap();
                assert_eq!(report.dispatch.dispatches, 12, "{mode} / {policy}");
                assert_eq!(report.dispatch.per_worker, vec![4, 4, 4]);
                for stats in &report.workers {
                    assert_eq!(stats.completed, 4);
                    assert_eq!(stats.phase, WorkerPhase::Terminated);
                    assert!(stats.eta_secs.is_some());
                }

                let rows = read_results(tmp.path().join("results.csv").as_path());
                assert_eq!(rows.len(), 4);
                for row in &rows {
                    assert_eq!(column(row, "ResWidth"), "2");
                    assert_eq!(column(row, "N_Pixels"), "4");
                    assert_eq!(column(row, "CharacterSize"), "1");
                    assert_eq!(column(row, "LeftOffset"), "1");
                    assert_eq!(column(row, "BoundingBoxArea"), "1");
                    assert_eq!(column(row, "VarietyRed"), "0");
                }
                // Inputs are fetched in sorted path order: bin/img0, bin/img2, bin/nested/...
                assert_eq!(column(&rows[1], "Brightness"), "80");
            }
        }
    }

    #[test]
    fn test_file_mode_leaves_intermediate_units() {
        let tmp = input_tree(3);
        let config = config(tmp.path(), CommunicationMode::Files, DispatchPolicy::Fifo);
        Pipeline::run_with_affinity(&config, Arc::new(NoAffinity)).unwrap();

        let work = tmp.path().join("work");
        for i in 0..3 {
            let cropped = image::open(work.join("cropped").join(format!("{i}.png"))).unwrap();
            assert_eq!((cropped.width(), cropped.height()), (2, 2));
            let raw = fs::read(work.join("stats").join(format!("{i}.json"))).unwrap();
            let record: serde_json::Value = serde_json::from_slice(&raw).unwrap();
            assert_eq!(record["Statistics"]["CharacterSize"], 1);
        }

        let rows = read_results(tmp.path().join("results.csv").as_path());
        assert_eq!(rows.len(), 3);
        assert!(rows[0][0].ends_with("0.json"));
    }

    #[test]
    fn test_empty_input_writes_empty_results() {
        let tmp = input_tree(0);
        let config = config(tmp.path(), CommunicationMode::Buffers, DispatchPolicy::RoundRobin);
        let report = Pipeline::run_with_affinity(&config, Arc::new(NoAffinity)).unwrap();

        assert_eq!(report.dispatch.dispatches, 0);
        assert!(read_results(tmp.path().join("results.csv").as_path()).is_empty());
    }

    #[test]
    fn test_unrequested_columns_are_left_empty() {
        let tmp = input_tree(1);
        let config = PipelineConfig {
            statistics: vec!["resolution".into(), "color variety".into()],
            background: None,
            ..config(tmp.path(), CommunicationMode::Buffers, DispatchPolicy::Fifo)
        };
        Pipeline::run_with_affinity(&config, Arc::new(NoAffinity)).unwrap();

        let rows = read_results(tmp.path().join("results.csv").as_path());
        assert_eq!(column(&rows[0], "ResHeight"), "2");
        assert_eq!(column(&rows[0], "VarietyBlue"), "0");
        assert_eq!(column(&rows[0], "N_Pixels"), "");
        assert_eq!(column(&rows[0], "Brightness"), "");
    }

    #[test]
    fn test_unknown_statistic_is_rejected_before_start() {
        let tmp = input_tree(1);
        let config = PipelineConfig {
            statistics: vec!["resolution".into(), "hue".into()],
            ..config(tmp.path(), CommunicationMode::Buffers, DispatchPolicy::Fifo)
        };
        let err = Pipeline::build_with_affinity(&config, Arc::new(NoAffinity)).err();
        assert!(matches!(
            err,
            Some(PipelineError::Config(ConfigError::UnknownStatistic(_)))
        ));
    }

    #[test]
    fn test_missing_input_dir_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), CommunicationMode::Buffers, DispatchPolicy::Fifo);
        let err = Pipeline::build_with_affinity(&config, Arc::new(NoAffinity)).err();
        assert!(matches!(
            err,
            Some(PipelineError::Config(ConfigError::InputDir { .. }))
        ));
    }

    #[test]
    fn test_sweep_records_one_entry_per_combination() {
        let tmp = input_tree(2);
        let sweep = SweepConfig {
            base: config(tmp.path(), CommunicationMode::Buffers, DispatchPolicy::Fifo),
            modes: vec![CommunicationMode::Buffers],
            policies: DispatchPolicy::ALL.to_vec(),
            repeat: 1,
        };
        let results = run_sweep_with_affinity(&sweep, Arc::new(NoAffinity)).unwrap();
        assert_eq!(results.len(), 30);
        assert!(results.values().all(|entry| entry.time > 0.0));
        assert_eq!(results[&0].parameters.policy, DispatchPolicy::RoundRobin);
        assert_eq!(results[&1].parameters.policy, DispatchPolicy::Fifo);

        let out = tmp.path().join("times.json");
        write_results(&out, &results).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&fs::read(&out).unwrap()).unwrap();
        assert_eq!(parsed.as_object().unwrap().len(), 30);
        assert!(parsed["29"]["parameters"]["logger_core"].is_u64());
    }
}
