//! GGUF variant selection.
//!
//! A `repo:variant` checkpoint picks files out of a repository by a five-case
//! rule, applied identically to the hub's file listing (when downloading) and
//! to the on-disk snapshot (when resolving a load path):
//!
//! 0. `*` — every `.gguf` file; the runtime auto-loads shards from the first.
//! 1. variant ends in `.gguf`/`.bin` — that exact file.
//! 2. empty variant — the first non-mmproj `.gguf` file.
//! 3. exactly one file ends with `{variant}.gguf` (case-insensitive) — that
//!    file. More than one match is an error.
//! 4. a folder named `{variant}` holds `.gguf` files — all of them, sharded.

use lemonade_core::{Error, Result};

const VARIANT_HINT: &str = "The CHECKPOINT:VARIANT scheme selects model files from a repository. \
     The variant can be: '*' (all .gguf files), an exact filename, empty \
     (first .gguf file), a quantization suffix matching a single file, or a \
     folder name holding sharded .gguf files.";

/// Files selected for a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufSelection {
    /// The file handed to the runtime (first shard for sharded models).
    pub primary: String,
    /// Remaining shard files, already sorted.
    pub shards: Vec<String>,
    /// Vision projector, when requested.
    pub mmproj: Option<String>,
}

impl GgufSelection {
    /// Every file the selection covers, primary first.
    pub fn all_files(&self) -> Vec<String> {
        let mut files = vec![self.primary.clone()];
        for shard in &self.shards {
            if *shard != self.primary {
                files.push(shard.clone());
            }
        }
        if let Some(mmproj) = &self.mmproj {
            files.push(mmproj.clone());
        }
        files
    }
}

/// Apply the five-case rule to `files` (relative paths within a repo or
/// snapshot directory).
pub fn select_gguf_files(
    files: &[String],
    variant: &str,
    mmproj: Option<&str>,
) -> Result<GgufSelection> {
    let mut selection = select_variant(files, variant)?;

    if let Some(mmproj) = mmproj {
        if !files.iter().any(|f| f == mmproj) {
            return Err(Error::validation(format!(
                "The provided mmproj file {mmproj} was not found in the repository."
            )));
        }
        selection.mmproj = Some(mmproj.to_string());
    }

    Ok(selection)
}

fn select_variant(files: &[String], variant: &str) -> Result<GgufSelection> {
    // Case 0: wildcard, take everything.
    if variant == "*" {
        let mut shards: Vec<String> = files
            .iter()
            .filter(|f| ends_with_ci(f, ".gguf"))
            .cloned()
            .collect();
        if shards.is_empty() {
            return Err(Error::validation(format!(
                "No .gguf files found in repository. {VARIANT_HINT}"
            )));
        }
        shards.sort();
        return Ok(GgufSelection {
            primary: shards[0].clone(),
            shards,
            mmproj: None,
        });
    }

    // Case 1: exact filename.
    if ends_with_ci(variant, ".gguf") || ends_with_ci(variant, ".bin") {
        if !files.iter().any(|f| f == variant) {
            return Err(Error::validation(format!(
                "File {variant} not found in repository. {VARIANT_HINT}"
            )));
        }
        return Ok(GgufSelection {
            primary: variant.to_string(),
            shards: Vec::new(),
            mmproj: None,
        });
    }

    // Case 2: no variant, first non-mmproj gguf.
    if variant.is_empty() {
        let mut candidates: Vec<String> = files
            .iter()
            .filter(|f| ends_with_ci(f, ".gguf") && !contains_ci(f, "mmproj"))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(Error::validation(format!(
                "No .gguf files found in repository. {VARIANT_HINT}"
            )));
        }
        candidates.sort();
        return Ok(GgufSelection {
            primary: candidates[0].clone(),
            shards: Vec::new(),
            mmproj: None,
        });
    }

    // Case 3: single file ending with `{variant}.gguf`.
    let suffix = format!("{}.gguf", variant.to_lowercase());
    let matching: Vec<String> = files
        .iter()
        .filter(|f| f.to_lowercase().ends_with(&suffix) && !contains_ci(f, "mmproj"))
        .cloned()
        .collect();
    match matching.len() {
        1 => {
            return Ok(GgufSelection {
                primary: matching[0].clone(),
                shards: Vec::new(),
                mmproj: None,
            });
        }
        n if n > 1 => {
            return Err(Error::validation(format!(
                "Multiple .gguf files found for variant {variant}, but only one is allowed. {VARIANT_HINT}"
            )));
        }
        _ => {}
    }

    // Case 4: folder of shards named after the variant.
    let folder_prefix = format!("{}/", variant.to_lowercase());
    let mut shards: Vec<String> = files
        .iter()
        .filter(|f| ends_with_ci(f, ".gguf") && f.to_lowercase().starts_with(&folder_prefix))
        .cloned()
        .collect();
    if shards.is_empty() {
        return Err(Error::validation(format!(
            "No .gguf files found for variant {variant}. {VARIANT_HINT}"
        )));
    }
    shards.sort();
    Ok(GgufSelection {
        primary: shards[0].clone(),
        shards,
        mmproj: None,
    })
}

fn ends_with_ci(s: &str, suffix: &str) -> bool {
    s.to_lowercase().ends_with(&suffix.to_lowercase())
}

fn contains_ci(s: &str, needle: &str) -> bool {
    s.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_wildcard_takes_all_ggufs_sorted() {
        let repo = files(&["b.gguf", "a.gguf", "README.md"]);
        let sel = select_gguf_files(&repo, "*", None).unwrap();
        assert_eq!(sel.primary, "a.gguf");
        assert_eq!(sel.shards, files(&["a.gguf", "b.gguf"]));
    }

    #[test]
    fn test_exact_filename() {
        let repo = files(&["model-q4_0.gguf", "model-q8_0.gguf"]);
        let sel = select_gguf_files(&repo, "model-q8_0.gguf", None).unwrap();
        assert_eq!(sel.primary, "model-q8_0.gguf");

        let err = select_gguf_files(&repo, "missing.gguf", None).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_empty_variant_skips_mmproj() {
        let repo = files(&["mmproj-f16.gguf", "model-q4_0.gguf"]);
        let sel = select_gguf_files(&repo, "", None).unwrap();
        assert_eq!(sel.primary, "model-q4_0.gguf");
    }

    #[test]
    fn test_quantization_suffix_case_insensitive() {
        let repo = files(&["Model-Q4_K_M.gguf", "Model-Q8_0.gguf"]);
        let sel = select_gguf_files(&repo, "q4_k_m", None).unwrap();
        assert_eq!(sel.primary, "Model-Q4_K_M.gguf");
    }

    #[test]
    fn test_suffix_round_trips_through_exact_name() {
        // Picking by suffix, then passing back the exact filename, lands on
        // the same file.
        let repo = files(&["model-q4_0.gguf", "model-q8_0.gguf"]);
        let by_suffix = select_gguf_files(&repo, "q4_0", None).unwrap();
        let by_name = select_gguf_files(&repo, &by_suffix.primary, None).unwrap();
        assert_eq!(by_suffix.primary, by_name.primary);
    }

    #[test]
    fn test_ambiguous_suffix_is_an_error() {
        let repo = files(&["a-q4_0.gguf", "b-q4_0.gguf"]);
        let err = select_gguf_files(&repo, "q4_0", None).unwrap_err();
        assert!(err.to_string().contains("Multiple"));
    }

    #[test]
    fn test_folder_sharding() {
        let repo = files(&[
            "Q4_K_M/model-00001-of-00002.gguf",
            "Q4_K_M/model-00002-of-00002.gguf",
            "Q8_0/model-00001-of-00001.gguf",
        ]);
        let sel = select_gguf_files(&repo, "Q4_K_M", None).unwrap();
        assert_eq!(sel.primary, "Q4_K_M/model-00001-of-00002.gguf");
        assert_eq!(sel.shards.len(), 2);
    }

    #[test]
    fn test_mmproj_must_exist() {
        let repo = files(&["model-q4_0.gguf", "mmproj-f16.gguf"]);
        let sel = select_gguf_files(&repo, "q4_0", Some("mmproj-f16.gguf")).unwrap();
        assert_eq!(sel.mmproj.as_deref(), Some("mmproj-f16.gguf"));
        assert_eq!(sel.all_files().len(), 2);

        let err = select_gguf_files(&repo, "q4_0", Some("mmproj-q8.gguf")).unwrap_err();
        assert!(err.to_string().contains("mmproj"));
    }
}
