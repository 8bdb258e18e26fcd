//! Pipeline Parser
//!
//! Handles loading the pipeline definition from YAML and the sample sheet
//! it points to.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::PipelineConfig;
use super::state::{Sample, SamplePaths};
use super::validator::validate_pipeline;
use crate::error::{PipelineError, Result};

/// Loads a pipeline definition from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the pipeline structure
///
/// # Example
///
/// ```rust,no_run
/// use seqflow::workflow::load_pipeline;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_pipeline("pipeline.yaml")?;
///     println!("Loaded {} steps", config.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineConfig> {
    let path = path.as_ref();
    info!("Loading pipeline from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let config: PipelineConfig = serde_yaml::from_str(&yaml_content)?;
    info!(
        "Parsed {} steps, strategy {:?}",
        config.steps.len(),
        config.strategy
    );

    validate_pipeline(&config)?;
    Ok(config)
}

/// Reads the sample sheet of a pipeline.
///
/// The sheet is tab-separated, one sample per line:
/// - unpaired: `raw_file<TAB>stub`
/// - paired: `raw_file_1<TAB>raw_file_2<TAB>stub`
///
/// Every raw file must exist and stubs must be unique. Relative raw paths
/// are made absolute against the current directory.
pub fn load_sample_sheet(config: &PipelineConfig) -> Result<Vec<Sample>> {
    let path = &config.samples;
    let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let mut samples = parse_sample_sheet(&content, config.sample_header, config.paired)?;

    let cwd = env::current_dir().map_err(|e| PipelineError::io(".", e))?;
    for sample in &mut samples {
        sample.raw = sample.raw.rooted_at(&cwd);

        for file in sample.raw.files() {
            if !Path::new(file).exists() {
                return Err(PipelineError::Config(format!(
                    "The file '{}' of sample '{}' does not exist",
                    file, sample.stub
                )));
            }
        }
    }

    info!("Read {} samples from {}", samples.len(), path.display());
    Ok(samples)
}

/// Parses sample sheet content without touching the filesystem.
pub fn parse_sample_sheet(content: &str, header: bool, paired: bool) -> Result<Vec<Sample>> {
    let expected = if paired { 3 } else { 2 };
    let mut samples = Vec::new();
    let mut seen = HashSet::new();

    let lines = content.lines().enumerate().skip(usize::from(header));
    for (number, line) in lines {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.trim().split('\t').map(str::trim).collect();
        if fields.len() < expected {
            return Err(PipelineError::Config(format!(
                "Sample sheet line {}: expected {} tab-separated columns, found {}",
                number + 1,
                expected,
                fields.len()
            )));
        }

        let (raw, stub) = if paired {
            (SamplePaths::pair(fields[0], fields[1]), fields[2])
        } else {
            (SamplePaths::single(fields[0]), fields[1])
        };

        if stub.is_empty() {
            return Err(PipelineError::Config(format!(
                "Sample sheet line {}: empty sample name",
                number + 1
            )));
        }
        if !seen.insert(stub.to_string()) {
            return Err(PipelineError::Config(format!(
                "Duplicate sample name '{}' in sample sheet",
                stub
            )));
        }

        samples.push(Sample::new(stub, raw));
    }

    if samples.is_empty() {
        return Err(PipelineError::Config(
            "Sample sheet does not contain any samples".to_string(),
        ));
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_unpaired_sheet_with_header() {
        let content = "file\tname\n/data/a.fastq\tA\n/data/b.fastq\tB\n";
        let samples = parse_sample_sheet(content, true, false).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].stub, "A");
        assert_eq!(samples[0].raw.primary, "/data/a.fastq");
        assert_eq!(samples[0].raw.secondary, None);
        assert_eq!(samples[1].stub, "B");
    }

    #[test]
    fn test_parse_paired_sheet() {
        let content = "/data/a_1.fq\t/data/a_2.fq\tA\n";
        let samples = parse_sample_sheet(content, false, true).unwrap();

        assert_eq!(samples[0].raw.primary, "/data/a_1.fq");
        assert_eq!(samples[0].raw.secondary.as_deref(), Some("/data/a_2.fq"));
    }

    #[test]
    fn test_parse_sheet_skips_blank_lines() {
        let content = "/data/a.fq\tA\n\n/data/b.fq\tB\n";
        let samples = parse_sample_sheet(content, false, false).unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn test_parse_sheet_duplicate_stub() {
        let content = "/data/a.fq\tA\n/data/b.fq\tA\n";
        let result = parse_sample_sheet(content, false, false);
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_parse_sheet_missing_column() {
        let content = "/data/a_1.fq\tA\n";
        let result = parse_sample_sheet(content, false, true);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_sheet_empty() {
        let result = parse_sample_sheet("header\n", true, false);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_sample_sheet_checks_files() {
        let temp_dir = tempdir().unwrap();
        let raw = temp_dir.path().join("a.fastq");
        fs::write(&raw, "@r1\nACGT\n+\nIIII\n").unwrap();

        let sheet = temp_dir.path().join("samples.txt");
        fs::write(&sheet, format!("{}\tA\n", raw.display())).unwrap();
        let config = PipelineConfig::new(temp_dir.path(), &sheet);
        assert_eq!(load_sample_sheet(&config).unwrap().len(), 1);

        fs::write(&sheet, format!("{}\tA\n/nonexistent/b.fastq\tB\n", raw.display())).unwrap();
        assert!(load_sample_sheet(&config).is_err());
    }

    #[test]
    fn test_load_sample_sheet_roots_relative_paths() {
        let temp_dir = tempfile::Builder::new()
            .prefix("sheet")
            .tempdir_in(".")
            .unwrap();
        let relative = temp_dir.path().join("a.fastq");
        assert!(relative.is_relative());
        fs::write(&relative, "@r1\nACGT\n+\nIIII\n").unwrap();

        let sheet = temp_dir.path().join("samples.txt");
        fs::write(&sheet, format!("{}\tA\n", relative.display())).unwrap();
        let samples = load_sample_sheet(&PipelineConfig::new(temp_dir.path(), &sheet)).unwrap();

        let expected = env::current_dir().unwrap().join(&relative);
        assert_eq!(samples[0].raw.primary, expected.display().to_string());
    }

    #[test]
    fn test_load_pipeline_file_not_found() {
        let result = load_pipeline("/nonexistent/path/pipeline.yaml");
        assert!(matches!(result, Err(PipelineError::Io { .. })));
    }

    #[test]
    fn test_load_pipeline_valid_yaml() {
        let temp_dir = tempdir().unwrap();
        let pipeline_path = temp_dir.path().join("pipeline.yaml");

        let yaml_content = r#"
working_dir: /data/run1
samples: /data/run1/samples.txt
strategy: local
steps:
  - name: fastqc
    input: raw_files
    program: /opt/wrappers/run_fastqc
  - name: trim
    input: raw_files
    output: fastq_files
    command: cutadapt -o {output} {input}
    outputs: "{step_dir}/{sample}.fastq"
"#;
        fs::write(&pipeline_path, yaml_content).unwrap();

        let config = load_pipeline(&pipeline_path).unwrap();
        assert_eq!(config.steps.len(), 2);
        assert_eq!(config.steps[1].flag(), "trim_raw_files");
        assert_eq!(config.local_cores, 1);
    }

    #[test]
    fn test_load_pipeline_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let pipeline_path = temp_dir.path().join("bad.yaml");
        fs::write(&pipeline_path, "this is not valid yaml: [[[").unwrap();

        let result = load_pipeline(&pipeline_path);
        assert!(matches!(result, Err(PipelineError::Yaml(_))));
    }
}
