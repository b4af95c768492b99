//! Converters between source-side codes and the registry's controlled
//! vocabulary. All functions are pure; unrecognized diagnosis shapes are
//! logged and dropped, never propagated as errors.

use tracing::warn;

/// URN prefix the registry expects on disease-ontology references.
pub const ICD_URN_PREFIX: &str = "urn:miriam:icd:";

/// Materials that the registry only knows as `OTHER`.
const MISC_MATERIALS: &[&str] = &["DERIVATIVE", "CSF_LIQUOR", "LIQUID", "ASCITES", "BONE_MARROW"];

/// Uppercases a source-side sex code. Callers must have resolved the value
/// already; absence is handled upstream by skipping the specimen.
pub fn convert_sex(sex: &str) -> String {
    sex.to_uppercase()
}

pub fn convert_material(material: Option<&str>) -> Option<String> {
    let material = material?;
    let mut normalized = material.replace('-', "_").to_uppercase();
    if let Some(stripped) = normalized.strip_suffix("_VITAL") {
        normalized = stripped.to_string();
    }
    let renamed = match normalized.as_str() {
        "TISSUE_FORMALIN" => "TISSUE_PARAFFIN_EMBEDDED",
        "TISSUE" => "TISSUE_FROZEN",
        "CF_DNA" => "CDNA",
        "BLOOD_SERUM" => "SERUM",
        "BLOOD_PLASMA" => "SERUM",
        "STOOL_FAECES" => "FECES",
        other => other,
    };
    if MISC_MATERIALS.contains(&renamed) || renamed.contains("OTHER") || renamed.contains("PAXGENE")
    {
        return Some("OTHER".to_string());
    }
    Some(renamed.to_string())
}

pub fn convert_storage_temperature(temperature: Option<&str>) -> Option<String> {
    let temperature = temperature?;
    if temperature == "temperatureGN" {
        return Some("temperatureOther".to_string());
    }
    Some(temperature.to_string())
}

/// Turns a bare ICD-10 code into the registry's URN form. Already-prefixed
/// values pass through unchanged, so the conversion is idempotent.
pub fn convert_diagnosis(diagnosis: Option<&str>) -> Option<String> {
    let diagnosis = diagnosis?;
    if diagnosis.starts_with(ICD_URN_PREFIX) {
        return Some(diagnosis.to_string());
    }
    if is_category_code(diagnosis) || is_dotted_code(diagnosis) {
        return Some(format!("{ICD_URN_PREFIX}{diagnosis}"));
    }
    warn!(code = diagnosis, "dropping diagnosis with unrecognized shape");
    None
}

/// Category-level code, e.g. `C75`.
fn is_category_code(code: &str) -> bool {
    code.len() == 3
}

/// Subcategory code with a dot, e.g. `E23.1`.
fn is_dotted_code(code: &str) -> bool {
    code.len() == 5 && code.as_bytes().get(3) == Some(&b'.')
}
