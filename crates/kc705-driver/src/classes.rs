//! ImageNet class labels.

use kc705_chip::image::NUM_CLASSES;
use std::borrow::Cow;

/// Labels bundled with the driver; the remaining classes are numbered.
pub const NAMED_CLASSES: [&str; 10] = [
    "tench",
    "goldfish",
    "great white shark",
    "tiger shark",
    "hammerhead",
    "electric ray",
    "stingray",
    "cock",
    "hen",
    "ostrich",
];

/// Label for `class_id`: its name if bundled, `class_<n>` below
/// [`NUM_CLASSES`], `unknown` beyond.
pub fn class_name(class_id: u32) -> Cow<'static, str> {
    let index = class_id as usize;
    if index >= NUM_CLASSES {
        Cow::Borrowed("unknown")
    } else if let Some(name) = NAMED_CLASSES.get(index) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("class_{class_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_names() {
        assert_eq!(class_name(0), "tench");
        assert_eq!(class_name(9), "ostrich");
        assert_eq!(class_name(10), "class_10");
        assert_eq!(class_name(999), "class_999");
        assert_eq!(class_name(1000), "unknown");
    }
}
