use std::{error::Error, fs, path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// A strongly separated synthetic feature table: 300 targets offset above
/// 300 decoys on the first feature, the second feature pure noise.
fn make_pin(dir: &PathBuf) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join("toy.pin");
    let mut text = String::from("SpecId\tLabel\tScanNr\tExpMass\tscore\tnoise\tPeptide\tProteins\n");
    let noise = |i: u32| ((i * 7919) % 1000) as f64 / 1000.0 - 0.5;
    for i in 0..300u32 {
        let scan_t = i * 2;
        let scan_d = i * 2 + 1;
        text.push_str(&format!(
            "target_{i}\t1\t{scan_t}\t1500.0\t{:.4}\t{:.4}\tK.PEPTIDE{}K.A\tsp|P{:05}\n",
            2.0 + noise(i),
            noise(i + 1000),
            i % 180,
            i
        ));
        text.push_str(&format!(
            "decoy_{i}\t-1\t{scan_d}\t1500.0\t{:.4}\t{:.4}\tK.EDITPEP{}K.A\trandom_{i}\n",
            noise(i + 2000),
            noise(i + 3000),
            i % 180
        ));
    }
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_file_missing() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("psmrescorer")?;

    cmd.arg("not_real.pin").args(["-r", "-"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
    Ok(())
}

#[test]
fn test_bad_fdr_rejected() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("psmrescorer")?;

    cmd.arg("not_real.pin").args(["--train-fdr", "1.5"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("is not within (0, 1]"));
    Ok(())
}

#[test]
fn test_run_synthetic() -> Result<(), Box<dyn Error>> {
    let dir = std::env::temp_dir().join("psmrescorer_process_test");
    let pin = make_pin(&dir);
    let out = dir.join("psms.tsv");
    let weights = dir.join("weights.tsv");

    let mut cmd = Command::cargo_bin("psmrescorer")?;
    cmd.arg(pin.to_str().unwrap())
        .args(["-r", out.to_str().unwrap()])
        .args(["-w", weights.to_str().unwrap()])
        .args(["--train-fdr", "0.05", "--test-fdr", "0.05"])
        .args(["--cpos", "1", "--cneg", "1"])
        .args(["--maxiter", "2", "--seed", "7", "-U"]);
    let result = cmd.assert().success();
    result
        .stderr(predicate::str::contains("Target PSMs: 300"))
        .stderr(predicate::str::contains("Decoy PSMs: 300"))
        .stderr(predicate::str::contains("Spectra: 600"));

    let table = fs::read_to_string(&out)?;
    let mut lines = table.lines();
    assert_eq!(
        lines.next().unwrap(),
        "PSMId\tscore\tq-value\tposterior_error_prob\tpeptide\tproteinIds"
    );
    // targets only
    assert_eq!(lines.clone().count(), 300);
    assert!(lines.all(|l| l.starts_with("target_")));

    let weight_table = fs::read_to_string(&weights)?;
    let mut lines = weight_table.lines();
    assert_eq!(lines.next().unwrap(), "score\tnoise\tm0");
    // one normalized and one raw line per fold
    assert_eq!(lines.count(), 6);
    Ok(())
}

#[test]
fn test_reproducible_for_seed() -> Result<(), Box<dyn Error>> {
    let dir = std::env::temp_dir().join("psmrescorer_reproducible_test");
    let pin = make_pin(&dir);

    let run = |out: &PathBuf| -> Result<(), Box<dyn Error>> {
        let mut cmd = Command::cargo_bin("psmrescorer")?;
        cmd.arg(pin.to_str().unwrap())
            .args(["-r", out.to_str().unwrap()])
            .args(["--train-fdr", "0.05", "--test-fdr", "0.05"])
            .args(["--cpos", "1", "--cneg", "1"])
            .args(["--maxiter", "2", "--seed", "11", "-U", "--no-pi0"]);
        cmd.assert().success();
        Ok(())
    };
    let out_a = dir.join("a.tsv");
    let out_b = dir.join("b.tsv");
    run(&out_a)?;
    run(&out_b)?;
    assert_eq!(fs::read_to_string(&out_a)?, fs::read_to_string(&out_b)?);
    Ok(())
}
