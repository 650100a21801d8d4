//! Prompt assembly, the gender hint and local auto-prompt generation.

use crate::parser::{labels, LabelMap, HAIR_LABELS};
use image::RgbImage;

pub const NEGATIVE_PROMPT: &str = "bad quality, blurry, distorted, deformed, ugly, bad anatomy, \
wrong face, disfigured, mutation, low resolution, pixelated, \
artifacts, watermark, multiple faces, cropped face, \
side view, profile, looking away, tilted head";

/// Used when the source cannot be described.
pub const DEFAULT_GENERATED_PROMPT: &str = "young adult, neutral skin tone, natural features, soft facial structure";

const WOMAN_HAIR_COVERAGE: f32 = 0.15;
const AMBIGUOUS_HAIR_COVERAGE: f32 = 0.08;
const SHORT_HAIR_COVERAGE: f32 = 0.01;
/// Skin pixels needed before a tone is reported.
const MIN_SKIN_PIXELS: usize = 16;

const SKIN_TONES: [(f32, &str); 6] = [
    (200.0, "fair skin"),
    (170.0, "light skin"),
    (140.0, "medium skin tone"),
    (110.0, "olive skin"),
    (80.0, "tan skin"),
    (0.0, "dark skin"),
];

/// Rough hint derived from how much of the source image is hair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenderHint {
    Woman,
    Ambiguous,
    Man,
}

impl GenderHint {
    /// `coverage` is the hair fraction of the source image, in [0, 1].
    pub fn from_hair_coverage(coverage: f32) -> Self {
        if coverage > WOMAN_HAIR_COVERAGE {
            GenderHint::Woman
        } else if coverage > AMBIGUOUS_HAIR_COVERAGE {
            GenderHint::Ambiguous
        } else {
            GenderHint::Man
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            GenderHint::Woman => "woman, ",
            GenderHint::Ambiguous => "",
            GenderHint::Man => "man, ",
        }
    }
}

/// The full ID-photo prompt around the user's text.
pub fn build_prompt(hint: Option<GenderHint>, user_prompt: &str) -> String {
    format!(
        "professional ID photo, passport style photograph, {}neutral background, studio lighting, \
front-facing portrait, sharp focus, high quality, even lighting, formal photograph, {}",
        hint.map(|h| h.prefix()).unwrap_or(""),
        user_prompt
    )
}

/// Describes a source face as prompt text.
pub trait PromptGenerator {
    fn generate(&mut self, face: &RgbImage, map: Option<&LabelMap>) -> String;
}

/// Describes skin tone and hair from the face parse; no network, no model.
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentationPrompter;

impl PromptGenerator for SegmentationPrompter {
    fn generate(&mut self, face: &RgbImage, map: Option<&LabelMap>) -> String {
        let Some(map) = map else {
            return DEFAULT_GENERATED_PROMPT.to_string();
        };
        let map = map.resized(face.width(), face.height());

        let skin = mean_luminance(face, &map, labels::SKIN);
        let tone = skin.map(skin_tone).unwrap_or("neutral skin tone");

        let mut parts = vec!["young adult".to_string(), tone.to_string()];
        let coverage = map.coverage(HAIR_LABELS);
        if coverage > SHORT_HAIR_COVERAGE {
            let length = if coverage > WOMAN_HAIR_COVERAGE {
                "long"
            } else if coverage > AMBIGUOUS_HAIR_COVERAGE {
                "medium-length"
            } else {
                "short"
            };
            let colour = mean_luminance(face, &map, labels::HAIR).map(hair_colour).unwrap_or("dark");
            parts.push(format!("{length} {colour} hair"));
        }
        parts.push("natural features".into());
        parts.push("soft facial structure".into());
        parts.join(", ")
    }
}

fn mean_luminance(image: &RgbImage, map: &LabelMap, label: u8) -> Option<f32> {
    let (sum, n) = image
        .enumerate_pixels()
        .filter(|(x, y, _)| map.label_at(*x, *y) == label)
        .fold((0.0f32, 0usize), |(s, n), (_, _, p)| {
            (s + 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32, n + 1)
        });
    (n >= MIN_SKIN_PIXELS).then(|| sum / n as f32)
}

fn skin_tone(luma: f32) -> &'static str {
    SKIN_TONES
        .iter()
        .find(|(min, _)| luma > *min)
        .map(|(_, name)| *name)
        .unwrap_or("dark skin")
}

fn hair_colour(luma: f32) -> &'static str {
    match luma {
        l if l < 60.0 => "black",
        l if l < 110.0 => "dark brown",
        l if l < 160.0 => "brown",
        _ => "light",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use image::Rgb;

    #[test]
    fn test_gender_thresholds() {
        assert_eq!(GenderHint::from_hair_coverage(0.20), GenderHint::Woman);
        assert_eq!(GenderHint::from_hair_coverage(0.15), GenderHint::Ambiguous);
        assert_eq!(GenderHint::from_hair_coverage(0.10), GenderHint::Ambiguous);
        assert_eq!(GenderHint::from_hair_coverage(0.08), GenderHint::Man);
        assert_eq!(GenderHint::from_hair_coverage(0.0), GenderHint::Man);
    }

    #[test]
    fn test_build_prompt() {
        let p = build_prompt(Some(GenderHint::Woman), "smiling");
        assert!(p.starts_with("professional ID photo, passport style photograph, woman, neutral background"));
        assert!(p.ends_with("formal photograph, smiling"));
        let p = build_prompt(Some(GenderHint::Ambiguous), "x");
        assert!(p.contains("photograph, neutral background"));
        assert_eq!(build_prompt(None, "x"), build_prompt(Some(GenderHint::Ambiguous), "x"));
    }

    #[test]
    fn test_default_without_parse() {
        let mut g = SegmentationPrompter;
        assert_eq!(g.generate(&RgbImage::new(4, 4), None), DEFAULT_GENERATED_PROMPT);
    }

    #[test]
    fn test_describes_skin_and_hair() {
        let face = RgbImage::from_fn(128, 128, |_, y| {
            if y < 48 {
                Rgb([30, 25, 20])
            } else {
                Rgb([230, 210, 200])
            }
        });
        let map = testing::parse_fixture(128, 128);
        let text = SegmentationPrompter.generate(&face, Some(&map));
        assert!(text.starts_with("young adult, fair skin, "), "{text}");
        assert!(text.contains("black hair"), "{text}");
        assert!(text.ends_with("natural features, soft facial structure"));
    }

    #[test]
    fn test_skin_buckets() {
        assert_eq!(skin_tone(220.0), "fair skin");
        assert_eq!(skin_tone(150.0), "medium skin tone");
        assert_eq!(skin_tone(50.0), "dark skin");
    }
}
