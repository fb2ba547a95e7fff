//! OCR quality grading and graceful degradation.
//!
//! Low-quality transcriptions are annotated and flagged for review rather
//! than failing the page.

use serde::Serialize;
use tracing::{debug, error, info, warn};

use folio_shared::DegradationConfig;

use crate::stages::OcrOutput;

/// Prefix put on transcriptions too poor to trust.
pub const POOR_QUALITY_MARKER: &str = "[POOR_QUALITY_OCR]";

/// Punctuation that does not count as noise.
const ALLOWED_PUNCTUATION: &str = " .,!?;:-()[]{}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    VeryPoor,
    Poor,
    Moderate,
    Good,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAssessment {
    pub score: f64,
    pub total_words: usize,
    pub unclear_word_count: usize,
    pub clarity_ratio: f64,
}

/// OCR output after grading.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedOcr {
    pub output: OcrOutput,
    pub quality_score: f64,
    pub quality_level: QualityLevel,
    /// Which treatment was applied (`minimal_processing`, `quality_markers`,
    /// `uncertainty_markers`), if any.
    pub degradation_applied: Option<&'static str>,
    pub requires_manual_review: bool,
    pub assessment: QualityAssessment,
    /// Set when grading itself went wrong; `output` is then untouched.
    pub degradation_error: Option<String>,
}

impl DegradedOcr {
    /// Warning label, absent for good pages.
    pub fn quality_warning(&self) -> Option<QualityLevel> {
        (self.quality_level != QualityLevel::Good).then_some(self.quality_level)
    }
}

/// Score a transcription in `[0, 1]`.
///
/// Starts at 1.0; loses half the unclear-to-word ratio, 0.3 for fewer than
/// ten words, and `0.3 * ratio` when more than 20% of characters are noise.
/// Gains up to 0.2 from the engine's share of normally transcribed words.
pub fn assess_quality(output: &OcrOutput) -> f64 {
    let text = &output.transcription;
    let total_words = text.split_whitespace().count();
    if total_words == 0 {
        return 0.0;
    }

    let mut score = 1.0;
    score -= output.unclear_sections.len() as f64 / total_words as f64 * 0.5;

    if total_words < 10 {
        score -= 0.3;
    }

    let chars = text.chars().count();
    let noise = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !ALLOWED_PUNCTUATION.contains(*c))
        .count();
    let noise_ratio = noise as f64 / chars as f64;
    if noise_ratio > 0.2 {
        score -= noise_ratio * 0.3;
    }

    if let Some(stats) = &output.processing_stats {
        let processed = stats.total_words.unwrap_or(total_words as u64);
        if processed > 0 {
            score += stats.normal_transcription as f64 / processed as f64 * 0.2;
        }
    }

    score.clamp(0.0, 1.0)
}

/// Wrap each unclear span that appears in the text with an inline marker.
pub fn add_quality_markers(transcription: &str, unclear_sections: &[String]) -> String {
    unclear_sections
        .iter()
        .filter(|s| !s.is_empty())
        .fold(transcription.to_string(), |text, unclear| {
            if text.contains(unclear.as_str()) {
                text.replace(unclear.as_str(), &format!("[UNCLEAR: {unclear}]"))
            } else {
                text
            }
        })
}

/// Grade `output` and apply the treatment for its quality level.
pub fn apply(
    thresholds: &DegradationConfig,
    output: OcrOutput,
    page_number: u32,
    file_name: &str,
) -> DegradedOcr {
    let score = assess_quality(&output);
    apply_score(thresholds, output, score, page_number, file_name)
}

/// Treatment for an already computed `score`. A score that is not a number
/// leaves the text untouched, but the page is still flagged for review.
fn apply_score(
    thresholds: &DegradationConfig,
    mut output: OcrOutput,
    score: f64,
    page_number: u32,
    file_name: &str,
) -> DegradedOcr {
    let total_words = output.transcription.split_whitespace().count();
    let unclear = output.unclear_sections.len();
    let assessment = QualityAssessment {
        score,
        total_words,
        unclear_word_count: unclear,
        clarity_ratio: if output.transcription.is_empty() {
            0.0
        } else {
            1.0 - unclear as f64 / total_words.max(1) as f64
        },
    };

    if !score.is_finite() {
        error!(page = page_number, file = file_name, "OCR quality score is not finite");
        return DegradedOcr {
            output,
            quality_score: 0.0,
            quality_level: QualityLevel::VeryPoor,
            degradation_applied: None,
            requires_manual_review: true,
            assessment,
            degradation_error: Some("quality score is not finite".into()),
        };
    }

    let (level, applied, review) = if score < thresholds.very_poor_below {
        warn!(page = page_number, file = file_name, score, "very poor OCR quality");
        output.transcription = format!("{POOR_QUALITY_MARKER} {}", output.transcription);
        (QualityLevel::VeryPoor, Some("minimal_processing"), true)
    } else if score < thresholds.poor_below {
        info!(page = page_number, file = file_name, score, "poor OCR quality");
        if !output.unclear_sections.is_empty() {
            output.transcription =
                add_quality_markers(&output.transcription, &output.unclear_sections);
        }
        (QualityLevel::Poor, Some("quality_markers"), false)
    } else if score < thresholds.moderate_below {
        debug!(page = page_number, file = file_name, score, "moderate OCR quality");
        (QualityLevel::Moderate, Some("uncertainty_markers"), false)
    } else {
        debug!(page = page_number, file = file_name, score, "good OCR quality");
        (QualityLevel::Good, None, false)
    };

    DegradedOcr {
        output,
        quality_score: score,
        quality_level: level,
        degradation_applied: applied,
        requires_manual_review: review,
        assessment,
        degradation_error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::ProcessingStats;

    fn ocr(text: &str, unclear: &[&str]) -> OcrOutput {
        OcrOutput {
            transcription: text.into(),
            unclear_sections: unclear.iter().map(|s| s.to_string()).collect(),
            ..OcrOutput::default()
        }
    }

    const CLEAN: &str = "En la ciudad de Medellin vivia un hombre que todos llamaban el baron";

    #[test]
    fn empty_text_scores_zero() {
        assert_eq!(assess_quality(&ocr("", &[])), 0.0);
        assert_eq!(assess_quality(&ocr("   \n ", &[])), 0.0);
    }

    #[test]
    fn unusable_score_is_very_poor_and_untouched() {
        let out = apply_score(
            &DegradationConfig::default(),
            ocr(CLEAN, &["baron"]),
            f64::NAN,
            4,
            "4.png",
        );
        assert_eq!(out.quality_level, QualityLevel::VeryPoor);
        assert_eq!(out.quality_warning(), Some(QualityLevel::VeryPoor));
        assert!(out.requires_manual_review);
        assert_eq!(out.quality_score, 0.0);
        assert!(out.degradation_error.is_some());
        assert!(out.degradation_applied.is_none());
        assert_eq!(out.output.transcription, CLEAN);
    }

    #[test]
    fn clean_text_is_good_and_untouched() {
        let out = apply(&DegradationConfig::default(), ocr(CLEAN, &[]), 1, "1.png");
        assert!(out.quality_score >= 0.8);
        assert_eq!(out.quality_level, QualityLevel::Good);
        assert!(out.quality_warning().is_none());
        assert!(!out.requires_manual_review);
        assert_eq!(out.output.transcription, CLEAN);
        assert!(out.degradation_applied.is_none());
    }

    #[test]
    fn garbage_is_flagged_for_review() {
        let out = apply(
            &DegradationConfig::default(),
            ocr("#@% &*~ ^^|", &["#@%", "&*~"]),
            3,
            "3.png",
        );
        assert!(out.quality_score < 0.3);
        assert_eq!(out.quality_level, QualityLevel::VeryPoor);
        assert!(out.requires_manual_review);
        assert!(out.output.transcription.starts_with(POOR_QUALITY_MARKER));
    }

    #[test]
    fn poor_text_gets_inline_markers() {
        // 12 words, 3 unclear: 1.0 - 0.125 = 0.875, so tighten thresholds.
        let text = "uno dos tres cuatro cinco seis siete ocho nueve diez once doce";
        let thresholds = DegradationConfig {
            very_poor_below: 0.3,
            poor_below: 0.9,
            moderate_below: 0.95,
        };
        let out = apply(&thresholds, ocr(text, &["tres", "ocho", "zzz"]), 2, "2.png");
        assert_eq!(out.quality_level, QualityLevel::Poor);
        assert!(out.output.transcription.contains("[UNCLEAR: tres]"));
        assert!(out.output.transcription.contains("[UNCLEAR: ocho]"));
        assert!(!out.output.transcription.contains("zzz"));
        assert_eq!(out.assessment.unclear_word_count, 3);
    }

    #[test]
    fn short_text_is_penalized() {
        let score = assess_quality(&ocr("hola mundo", &[]));
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn engine_stats_add_bonus() {
        let mut out = ocr("hola mundo", &[]);
        out.processing_stats = Some(ProcessingStats {
            total_words: Some(2),
            normal_transcription: 2,
            ..ProcessingStats::default()
        });
        assert!((assess_quality(&out) - 0.9).abs() < 1e-9);
    }
}
