/// Product families and the model codes processed for each, newest first.
const PRODUCT_CODES: &[(&str, &[&str])] = &[
    ("iPad", &[
        "16,6", "16,4", "16,2",
        "15,8", "15,7", "15,6", "15,5", "15,4", "15,3",
        "14,11", "14,9", "14,6", "14,4", "14,2",
        "13,19", "13,17", "13,11", "13,10", "13,7", "13,5", "13,2",
        "12,2",
        "11,7", "11,4", "11,2",
        "8,12", "8,10", "8,8", "8,7", "8,4", "8,3",
        "7,12", "7,6", "7,4", "7,2",
        "6,12", "6,8", "6,4",
        "5,4", "5,2",
        "4,9", "4,8", "4,6", "4,5", "4,3", "4,2",
        "3,6", "3,5", "3,3", "3,2",
        "2,7", "2,6", "2,3", "2,2",
        "1,1",
    ]),
    ("iPhone", &[
        "14,6", "14,5", "14,4", "14,3", "14,2",
        "13,4", "13,3", "13,2", "13,1",
        "12,8", "12,5", "12,3", "12,1",
        "11,8", "11,6", "11,4", "11,2",
        "10,6", "10,5", "10,4", "10,2", "10,1",
        "9,4", "9,3", "9,2", "9,1",
        "8,4", "8,2", "8,1",
        "7,2", "7,1",
        "6,2", "6,1",
        "5,4", "5,3", "5,2", "5,1",
        "4,1",
        "3,3", "3,2", "3,1",
        "2,1",
    ]),
];

/// Model identifiers of every supported device (eg. `iPhone14,2`), without
/// duplicates.
pub fn models() -> Vec<String> {
    let mut models: Vec<String> = Vec::new();

    for (product, codes) in PRODUCT_CODES {
        for code in codes.iter() {
            let model = format!("{product}{code}");
            if !models.contains(&model) {
                models.push(model);
            }
        }
    }

    models
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_models() {
        let models = models();

        assert_eq!(models.first().map(String::as_str), Some("iPad16,6"));
        assert_eq!(models.last().map(String::as_str), Some("iPhone2,1"));
        assert!(models.iter().any(|m| m == "iPhone10,4"));

        let unique: HashSet<_> = models.iter().collect();
        assert_eq!(unique.len(), models.len());
    }
}
