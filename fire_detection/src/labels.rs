use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Loads class labels from a newline-delimited file, one label per line.
/// Line index equals the model's class id.
pub fn load_class_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if !label.is_empty() {
            labels.push(label.to_string());
        }
    }

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_class_labels() {
        let path = std::env::temp_dir().join("fire_detection_labels_test.txt");
        std::fs::write(&path, "fire\nsmoke\n\nperson\n").unwrap();

        let labels = load_class_labels(&path).unwrap();

        assert_eq!(labels, vec!["fire", "smoke", "person"]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_class_labels_missing_file() {
        let path = std::env::temp_dir().join("fire_detection_labels_missing.txt");
        assert!(load_class_labels(&path).is_err());
    }
}
