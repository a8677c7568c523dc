//! Benchmark-harness plumbing: dict-like eval records, the dataset-kind and
//! image-root registries, CJK detection for the bilingual instruction
//! suffix, and the on-disk cache that materializes base64 image payloads.

use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{Map, Value};

use crate::llava::utils::LlavaError;

const OPTION_LETTERS: [&str; 5] = ["A", "B", "C", "D", "E"];

const ENGLISH_SUFFIX: &str = "Answer with the option's letter from the given choices directly.";
const CHINESE_SUFFIX: &str = "请直接回答选项字母。";

/// Broad behavior class of a benchmark dataset. Only `MultiChoice` changes
/// how prompts are assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    MultiChoice,
    YesOrNo,
    Caption,
    Vqa,
}

pub fn dataset_kind(name: &str) -> DatasetKind {
    let lower = name.to_ascii_lowercase();
    const MULTI_CHOICE: [&str; 6] = ["mmbench", "ccbench", "seedbench", "scienceqa", "mmmu", "ai2d"];
    if MULTI_CHOICE.iter().any(|needle| lower.contains(needle)) {
        DatasetKind::MultiChoice
    } else if lower.contains("mme") || lower.contains("pope") {
        DatasetKind::YesOrNo
    } else if lower.contains("coco") {
        DatasetKind::Caption
    } else {
        DatasetKind::Vqa
    }
}

/// Image-cache directory name for a dataset; split variants of one family
/// (dev/test, EN/CN) share a root.
pub fn image_root(dataset: Option<&str>) -> String {
    let Some(name) = dataset else {
        return "default".to_string();
    };
    let lower = name.to_ascii_lowercase();
    const FAMILIES: [(&str, &str); 7] = [
        ("mmbench", "MMBench"),
        ("ccbench", "CCBench"),
        ("seedbench", "SEEDBench_IMG"),
        ("scienceqa", "ScienceQA"),
        ("mmmu", "MMMU"),
        ("ai2d", "AI2D"),
        ("coco", "COCO"),
    ];
    for (needle, root) in FAMILIES {
        if lower.contains(needle) {
            return root.to_string();
        }
    }
    name.to_string()
}

/// One benchmark row with dict-like field access. A JSON `null` value counts
/// as a missing field.
#[derive(Debug, Clone, Default)]
pub struct EvalRecord(Map<String, Value>);

impl EvalRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.0.get(key) {
            Some(Value::Null) | None => None,
            Some(value) => Some(value),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn require_str(&self, key: &str) -> Result<&str, LlavaError> {
        self.get_str(key)
            .ok_or_else(|| LlavaError::MissingField(key.to_string()))
    }

    /// The row index, stringified; used as the cached image file stem.
    pub fn index_label(&self) -> Result<String, LlavaError> {
        match self.get("index") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(LlavaError::MissingField("index".to_string())),
        }
    }
}

/// Image half of a prompt record: one cached path, or an ordered list for
/// datasets with several images per question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Single(PathBuf),
    Multi(Vec<PathBuf>),
}

impl ImageSource {
    /// The one path `generate` accepts. Multi-image records are rejected
    /// rather than silently truncated.
    pub fn single(&self) -> Result<&Path, LlavaError> {
        match self {
            ImageSource::Single(path) => Ok(path),
            ImageSource::Multi(_) => Err(LlavaError::MultiImageUnsupported),
        }
    }
}

/// Output of `build_prompt`, consumed by `generate`.
#[derive(Debug, Clone)]
pub struct PromptInput {
    pub image: ImageSource,
    pub text: String,
}

/// CJK-ideograph membership check; script detection, not language
/// identification.
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

fn readable_image(path: &Path) -> bool {
    path.is_file() && image::open(path).is_ok()
}

fn decode_base64_to_image_file(data: &str, path: &Path) -> Result<(), LlavaError> {
    let bytes = BASE64.decode(data)?;
    image::load_from_memory(&bytes)?.to_rgb8().save(path)?;
    Ok(())
}

/// Decode the record's base64 image payload(s) into `img_root`, skipping
/// targets that already exist and decode cleanly. The single-image case is
/// named after the row index; the list case takes its names from
/// `image_path`.
pub fn materialize_images(
    record: &EvalRecord,
    img_root: &Path,
) -> Result<ImageSource, LlavaError> {
    fs::create_dir_all(img_root)?;
    match record.get("image") {
        Some(Value::Array(images)) => {
            let names = match record.get("image_path") {
                Some(Value::Array(names)) => names,
                _ => return Err(LlavaError::MissingField("image_path".to_string())),
            };
            if names.len() != images.len() {
                return Err(LlavaError::MismatchedImageList {
                    images: images.len(),
                    names: names.len(),
                });
            }
            let mut paths = Vec::with_capacity(images.len());
            for (image, name) in images.iter().zip(names) {
                let image = image
                    .as_str()
                    .ok_or_else(|| LlavaError::MissingField("image".to_string()))?;
                let name = name
                    .as_str()
                    .ok_or_else(|| LlavaError::MissingField("image_path".to_string()))?;
                let path = img_root.join(name);
                if !readable_image(&path) {
                    decode_base64_to_image_file(image, &path)?;
                }
                paths.push(path);
            }
            Ok(ImageSource::Multi(paths))
        }
        Some(Value::String(data)) => {
            let path = img_root.join(format!("{}.jpg", record.index_label()?));
            if !readable_image(&path) {
                decode_base64_to_image_file(data, &path)?;
            }
            Ok(ImageSource::Single(path))
        }
        _ => Err(LlavaError::MissingField("image".to_string())),
    }
}

/// Assemble the question, option lines and the bilingual letter-answer
/// instruction for a multiple-choice row.
pub fn multi_choice_text(record: &EvalRecord) -> Result<String, LlavaError> {
    let question = record.require_str("question")?;
    let question = match record.get_str("hint") {
        Some(hint) => format!("{hint} {question}"),
        None => question.to_string(),
    };

    let mut options = String::from("There are several options:\n");
    for letter in OPTION_LETTERS {
        if let Some(text) = record.get_str(letter) {
            options.push_str(&format!("{letter}. {text}\n"));
        }
    }

    let mut prompt = format!("{question} {options}");
    let suffix = if contains_cjk(&prompt) {
        CHINESE_SUFFIX
    } else {
        ENGLISH_SUFFIX
    };
    prompt.push('\n');
    prompt.push_str(suffix);
    Ok(prompt)
}

/// Prompt text for a row: option-formatted for multiple-choice datasets, the
/// raw question otherwise.
pub fn prompt_text(record: &EvalRecord, dataset: Option<&str>) -> Result<String, LlavaError> {
    match dataset {
        Some(name) if dataset_kind(name) == DatasetKind::MultiChoice => multi_choice_text(record),
        _ => Ok(record.require_str("question")?.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn png_base64(color: Rgb<u8>) -> String {
        let img = RgbImage::from_pixel(4, 4, color);
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        BASE64.encode(&bytes)
    }

    #[test]
    fn dataset_kinds() {
        assert_eq!(dataset_kind("MMBench_DEV_CN"), DatasetKind::MultiChoice);
        assert_eq!(dataset_kind("ScienceQA_TEST"), DatasetKind::MultiChoice);
        assert_eq!(dataset_kind("MME"), DatasetKind::YesOrNo);
        assert_eq!(dataset_kind("COCO_VAL"), DatasetKind::Caption);
        assert_eq!(dataset_kind("OCRVQA_TEST"), DatasetKind::Vqa);
    }

    #[test]
    fn image_roots_collapse_dataset_families() {
        assert_eq!(image_root(Some("MMBench_DEV_EN")), "MMBench");
        assert_eq!(image_root(Some("MMBench_TEST_CN")), "MMBench");
        assert_eq!(image_root(Some("SomethingNew")), "SomethingNew");
        assert_eq!(image_root(None), "default");
    }

    #[test]
    fn null_fields_count_as_missing() {
        let record = EvalRecord::new()
            .with("question", "q")
            .with("hint", Value::Null);
        assert_eq!(record.get_str("hint"), None);
        assert_eq!(record.get_str("question"), Some("q"));
    }

    #[test]
    fn option_lines_follow_letter_order() {
        // insertion order deliberately scrambled; output order must not care
        let record = EvalRecord::new()
            .with("C", "Gamma")
            .with("question", "Pick one.")
            .with("A", "Alpha")
            .with("B", "Beta")
            .with("D", Value::Null);
        let text = multi_choice_text(&record).unwrap();
        assert_eq!(
            text,
            "Pick one. There are several options:\nA. Alpha\nB. Beta\nC. Gamma\n\n\
             Answer with the option's letter from the given choices directly."
        );
    }

    #[test]
    fn sky_question_prompt_shape() {
        let record = EvalRecord::new()
            .with("question", "What color is the sky?")
            .with("A", "Blue")
            .with("B", "Green");
        let text = multi_choice_text(&record).unwrap();
        assert_eq!(
            text,
            "What color is the sky? There are several options:\nA. Blue\nB. Green\n\n\
             Answer with the option's letter from the given choices directly."
        );
    }

    #[test]
    fn hint_is_prepended() {
        let record = EvalRecord::new()
            .with("question", "Which?")
            .with("hint", "Look closely.")
            .with("A", "x");
        let text = multi_choice_text(&record).unwrap();
        assert!(text.starts_with("Look closely. Which? There are several options:\n"));
    }

    #[test]
    fn chinese_rows_get_the_chinese_suffix() {
        let record = EvalRecord::new()
            .with("question", "天空是什么颜色？")
            .with("A", "蓝色");
        let text = multi_choice_text(&record).unwrap();
        assert!(text.ends_with(CHINESE_SUFFIX));
        assert!(!text.contains(ENGLISH_SUFFIX));
    }

    #[test]
    fn non_multi_choice_rows_pass_the_raw_question() {
        let record = EvalRecord::new()
            .with("question", "Describe the image.")
            .with("A", "should be ignored");
        let text = prompt_text(&record, Some("OCRVQA_TEST")).unwrap();
        assert_eq!(text, "Describe the image.");
        let text = prompt_text(&record, None).unwrap();
        assert_eq!(text, "Describe the image.");
    }

    #[test]
    fn single_image_is_cached_under_the_row_index() {
        let tmp = tempfile::tempdir().unwrap();
        let record = EvalRecord::new()
            .with("index", 42)
            .with("image", png_base64(Rgb([10, 20, 30])));
        let source = materialize_images(&record, tmp.path()).unwrap();
        let path = match source {
            ImageSource::Single(path) => path,
            ImageSource::Multi(_) => panic!("expected a single path"),
        };
        assert_eq!(path, tmp.path().join("42.jpg"));
        assert!(image::open(&path).is_ok());
    }

    #[test]
    fn existing_readable_images_are_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let record = EvalRecord::new()
            .with("index", 7)
            .with("image", png_base64(Rgb([10, 20, 30])));

        let first = materialize_images(&record, tmp.path()).unwrap();
        let path = first.single().unwrap().to_path_buf();
        let cached = fs::read(&path).unwrap();

        // second call with a different payload must leave the cache alone
        let record = EvalRecord::new()
            .with("index", 7)
            .with("image", png_base64(Rgb([200, 0, 0])));
        let second = materialize_images(&record, tmp.path()).unwrap();
        assert_eq!(second.single().unwrap(), path.as_path());
        assert_eq!(fs::read(&path).unwrap(), cached);
    }

    #[test]
    fn image_lists_use_names_from_image_path() {
        let tmp = tempfile::tempdir().unwrap();
        let record = EvalRecord::new()
            .with("index", 1)
            .with(
                "image",
                vec![png_base64(Rgb([1, 1, 1])), png_base64(Rgb([2, 2, 2]))],
            )
            .with("image_path", vec!["left.jpg", "right.jpg"]);
        let source = materialize_images(&record, tmp.path()).unwrap();
        match source {
            ImageSource::Multi(paths) => {
                assert_eq!(
                    paths,
                    vec![tmp.path().join("left.jpg"), tmp.path().join("right.jpg")]
                );
                assert!(paths.iter().all(|p| p.is_file()));
            }
            ImageSource::Single(_) => panic!("expected a path list"),
        }
    }

    #[test]
    fn image_list_length_mismatch_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let record = EvalRecord::new()
            .with("image", vec![png_base64(Rgb([1, 1, 1]))])
            .with("image_path", vec!["a.jpg", "b.jpg"]);
        assert!(matches!(
            materialize_images(&record, tmp.path()),
            Err(LlavaError::MismatchedImageList { images: 1, names: 2 })
        ));
    }

    #[test]
    fn multi_image_sources_refuse_to_collapse() {
        let source = ImageSource::Multi(vec![PathBuf::from("a.jpg")]);
        assert!(matches!(
            source.single(),
            Err(LlavaError::MultiImageUnsupported)
        ));
    }
}
