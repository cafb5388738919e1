use longmix_ingest::{LoadOptions, exclude_outliers, load_imputations};
use tempfile::TempDir;

const HEADER: &str = "replicate_id,participant_id,treatment,time,baseline,crp,crp_outlier\n";

fn write_imputation(dir: &TempDir, index: usize, shift: f64) {
    let mut body = String::from(HEADER);
    let participants = [("R1", "P1", "A"), ("R1", "P2", "B"), ("R2", "P3", "A")];
    for (replicate, participant, treatment) in participants {
        for time in 0..3 {
            let value = 2.0 + shift + f64::from(time) * 0.5;
            let outlier = participant == "P2" && time == 2;
            body.push_str(&format!(
                "{replicate},{participant},{treatment},{time},1.0,{value},{outlier}\n"
            ));
        }
    }
    std::fs::write(dir.path().join(format!("crp_imp{index}.csv")), body).unwrap();
}

#[test]
fn loads_all_imputations_in_order() {
    let dir = TempDir::new().unwrap();
    for index in [3, 1, 2] {
        write_imputation(&dir, index, index as f64 * 0.1);
    }
    std::fs::write(dir.path().join("notes.csv"), "a\n1\n").unwrap();

    let options = LoadOptions::default().with_outcomes(["crp".to_string()]);
    let datasets = load_imputations(dir.path(), &options).unwrap();
    let indices: Vec<usize> = datasets.iter().map(|d| d.index()).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert!(datasets.iter().all(|d| d.height() == 9));
    assert!(datasets[0].source().unwrap().ends_with("crp_imp1.csv"));
}

#[test]
fn outlier_exclusion_uses_outcome_flag() {
    let dir = TempDir::new().unwrap();
    write_imputation(&dir, 1, 0.0);
    let options = LoadOptions::default().with_outcomes(["crp".to_string()]);
    let datasets = load_imputations(dir.path(), &options).unwrap();

    let filtered = exclude_outliers(&datasets[0], "crp", "{outcome}_outlier").unwrap();
    assert_eq!(filtered.height(), 8);
    assert_eq!(datasets[0].height(), 9);
}
