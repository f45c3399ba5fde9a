#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use kms_keymanager::reconcile::{key_label, parse_key_label};

#[derive(Arbitrary, Debug)]
struct LabelFuzzInput {
    prefix: String,
    logical_id: String,
    label: String,
}

fuzz_target!(|input: LabelFuzzInput| {
    // Labels built by the key manager always parse back to their id
    if !input.prefix.is_empty() {
        let label = key_label(&input.prefix, &input.logical_id);
        assert_eq!(
            parse_key_label(&input.prefix, &label),
            Some(input.logical_id.as_str())
        );
    }

    // Arbitrary labels only parse when they start with the prefix
    if let Some(id) = parse_key_label(&input.prefix, &input.label) {
        assert!(input.label.starts_with(&input.prefix));
        assert_eq!(input.label.len(), input.prefix.len() + id.len());
    }
});
