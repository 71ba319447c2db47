use std::fs;

use figment::{
    providers::{Format, Toml},
    Figment,
};

fn make_pin(dir: &std::path::Path) -> std::path::PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join("configured.pin");
    let mut text = String::from("SpecId\tLabel\tScanNr\tscore\tnoise\tPeptide\tProteins\n");
    let noise = |i: u32| ((i * 104729) % 1000) as f64 / 1000.0 - 0.5;
    for i in 0..200u32 {
        text.push_str(&format!(
            "t{i}\t1\t{}\t{:.4}\t{:.4}\tK.PEP{}K.A\tp{i}\n",
            i * 2,
            2.0 + noise(i),
            noise(i + 1000),
            i
        ));
        text.push_str(&format!(
            "d{i}\t-1\t{}\t{:.4}\t{:.4}\tK.DEC{}K.A\tr{i}\n",
            i * 2 + 1,
            noise(i + 2000),
            noise(i + 3000),
            i
        ));
    }
    fs::write(&path, text).unwrap();
    path
}

#[test_log::test]
#[test_log(default_log_filter = "debug")]
fn test_configured_run() {
    let dir = std::env::temp_dir().join("psmrescorer_configured_test");
    let pin = make_pin(&dir);
    let out = dir.join("configured_psms.tsv");

    let config_path = dir.join("configured.toml");
    let config_text = format!(
        r#"
input_file = {pin:?}
results_psms = {out:?}
train_fdr = 0.05
test_fdr = 0.05
maxiter = 2
cpos = 1.0
cneg = 1.0
num_folds = 3
quick_validation = false
train_best_positive = false
override_direction_check = false
only_psms = true
no_pi0 = true
seed = 3
report_each_iteration = false
threads = 2
verbosity = 2
unit_norm = false
skip_feature_normalization = false
skip_score_normalization = false
"#
    );
    fs::write(&config_path, config_text).unwrap();

    let mut config = Figment::new();
    config = config.merge(Toml::file_exact(&config_path));
    let driver: psmrescorer::PsmRescorer = config.extract().unwrap();
    assert_eq!(driver.seed, 3);
    assert_eq!(driver.num_folds, 3);
    driver.main().unwrap();

    let table = fs::read_to_string(&out).unwrap();
    assert!(table.starts_with("PSMId\tscore\t"));
    assert_eq!(table.lines().count(), 201);
}
