use crate::scorer::QualityScore;
use crate::sequence::{BoundArg, CallSequence};
use crate::surface::{ApiSurface, CallClass, HandleStorage, HandleType, HandleTypeId, ReturnRole};
use crate::tracker::InstanceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeedParseError {
    #[error("Missing or malformed {0} header line")]
    MalformedHeader(&'static str),

    #[error("Header JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Header reports {header} unique branches but the quality set holds {quality}")]
    BranchCountMismatch { header: usize, quality: usize },
}

/// Errors emitting a C body. Only reachable through corrupted or
/// hand-edited sequences; fresh synthesis output always renders.
#[derive(Error, Debug)]
pub enum BodyEmitError {
    #[error("Call '{0}' references descriptor index {1} outside the surface")]
    UnknownDescriptor(String, usize),

    #[error("Instance {0} has no recorded handle type")]
    UnknownInstanceType(InstanceId),

    #[error("Instance {0} records handle type {1:?} outside the surface")]
    UnknownHandleType(InstanceId, HandleTypeId),
}

/// The `<Quality>` header payload. Field order here is the serialized key
/// order, so re-rendering a parsed header is byte-identical.
#[derive(Serialize, Deserialize)]
struct QualityJson {
    density: f64,
    unique_branches: BTreeMap<String, u32>,
    library_calls: Vec<String>,
    critical_calls: Vec<String>,
    visited: u64,
}

/// One persisted corpus seed: the structured metadata header plus the
/// emitted C function body.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedEntry {
    pub id: u64,
    /// Free-form generation context. May be empty.
    pub prompt: String,
    /// The call-set constraint the sequence was synthesized under, in
    /// first-use order.
    pub combination: Vec<String>,
    pub quality: QualityScore,
    pub body: String,
}

impl SeedEntry {
    /// Assembles an entry from a scored sequence. The combination is the
    /// sequence's distinct call names and the body is emitted fresh.
    pub fn from_sequence(
        id: u64,
        prompt: impl Into<String>,
        sequence: &CallSequence,
        quality: QualityScore,
        surface: &ApiSurface,
    ) -> Result<Self, BodyEmitError> {
        let mut combination = Vec::new();
        for call in &sequence.calls {
            if !combination.contains(&call.name) {
                combination.push(call.name.clone());
            }
        }
        Ok(Self {
            id,
            prompt: prompt.into(),
            combination,
            quality,
            body: emit_body(sequence, surface)?,
        })
    }

    /// Renders the bit-exact persisted form: five header lines followed by
    /// the body.
    pub fn render(&self) -> String {
        let quality_json = QualityJson {
            density: self.quality.density,
            unique_branches: self.quality.unique_branches.clone(),
            library_calls: self.quality.library_calls.clone(),
            critical_calls: self.quality.critical_calls.clone(),
            visited: self.quality.visited,
        };
        // QualityJson serialization is infallible for these field types.
        let quality_line =
            serde_json::to_string(&quality_json).expect("quality header serializes");
        let combination_line =
            serde_json::to_string(&self.combination).expect("combination serializes");
        format!(
            "//<ID> {}\n//<Prompt> {}\n/*<Combination>: {} */\n//<score> {}, nr_unique_branch: {}\n//<Quality> {}\n{}",
            self.id,
            self.prompt,
            combination_line,
            self.quality.score,
            self.quality.unique_branches.len(),
            quality_line,
            self.body,
        )
    }

    /// Parses a persisted seed back into its structured form. Re-rendering
    /// the result reproduces the original text exactly.
    pub fn parse(text: &str) -> Result<Self, SeedParseError> {
        let mut lines = text.split('\n');

        let id_line = lines.next().ok_or(SeedParseError::MalformedHeader("<ID>"))?;
        let id = id_line
            .strip_prefix("//<ID> ")
            .and_then(|rest| rest.parse::<u64>().ok())
            .ok_or(SeedParseError::MalformedHeader("<ID>"))?;

        let prompt_line = lines.next().ok_or(SeedParseError::MalformedHeader("<Prompt>"))?;
        let prompt = prompt_line
            .strip_prefix("//<Prompt> ")
            .or_else(|| prompt_line.strip_prefix("//<Prompt>"))
            .ok_or(SeedParseError::MalformedHeader("<Prompt>"))?
            .to_string();

        let comb_line = lines
            .next()
            .ok_or(SeedParseError::MalformedHeader("<Combination>"))?;
        let comb_json = comb_line
            .strip_prefix("/*<Combination>: ")
            .and_then(|rest| rest.strip_suffix(" */"))
            .ok_or(SeedParseError::MalformedHeader("<Combination>"))?;
        let combination: Vec<String> = serde_json::from_str(comb_json)?;

        let score_line = lines.next().ok_or(SeedParseError::MalformedHeader("<score>"))?;
        let score_rest = score_line
            .strip_prefix("//<score> ")
            .ok_or(SeedParseError::MalformedHeader("<score>"))?;
        let (score_text, nr_text) = score_rest
            .split_once(", nr_unique_branch: ")
            .ok_or(SeedParseError::MalformedHeader("<score>"))?;
        let score: f64 = score_text
            .parse()
            .map_err(|_| SeedParseError::MalformedHeader("<score>"))?;
        let nr_unique: usize = nr_text
            .parse()
            .map_err(|_| SeedParseError::MalformedHeader("<score>"))?;

        let quality_line = lines.next().ok_or(SeedParseError::MalformedHeader("<Quality>"))?;
        let quality_json = quality_line
            .strip_prefix("//<Quality> ")
            .ok_or(SeedParseError::MalformedHeader("<Quality>"))?;
        let parsed: QualityJson = serde_json::from_str(quality_json)?;
        if parsed.unique_branches.len() != nr_unique {
            return Err(SeedParseError::BranchCountMismatch {
                header: nr_unique,
                quality: parsed.unique_branches.len(),
            });
        }

        let body: String = lines.collect::<Vec<&str>>().join("\n");

        Ok(Self {
            id,
            prompt,
            combination,
            quality: QualityScore {
                score,
                density: parsed.density,
                unique_branches: parsed.unique_branches,
                library_calls: parsed.library_calls,
                critical_calls: parsed.critical_calls,
                visited: parsed.visited,
            },
            body,
        })
    }
}

fn phase_marker(class: CallClass) -> &'static str {
    match class {
        CallClass::Create => "    /* step 1: initialize */",
        CallClass::Configure => "    /* step 2: configure */",
        CallClass::Operate | CallClass::Validate => "    /* step 3: operate and validate */",
        CallClass::Cleanup => "    /* step 4: cleanup */",
    }
}

/// Handle type of one instance, rejecting ids a corrupted sequence may
/// carry instead of panicking on them.
fn handle_type_of<'a>(
    id: InstanceId,
    sequence: &CallSequence,
    surface: &'a ApiSurface,
) -> Result<&'a HandleType, BodyEmitError> {
    let ht = sequence
        .instance_types
        .get(id.0)
        .copied()
        .ok_or(BodyEmitError::UnknownInstanceType(id))?;
    surface
        .try_handle_type(ht)
        .ok_or(BodyEmitError::UnknownHandleType(id, ht))
}

fn render_arg(
    arg: &BoundArg,
    sequence: &CallSequence,
    surface: &ApiSurface,
) -> Result<String, BodyEmitError> {
    Ok(match arg {
        BoundArg::Handle(id) => match handle_type_of(*id, sequence, surface)?.storage {
            HandleStorage::Pointer => format!("{id}"),
            HandleStorage::Value => format!("&{id}"),
        },
        BoundArg::OutHandle(id) => format!("&{id}"),
        BoundArg::Scalar(v) => v.render_c(),
        BoundArg::Fixed(text) => text.clone(),
    })
}

/// Emits the C function body for a sequence: includes, one declaration per
/// produced handle, phase markers whenever the lifecycle phase changes, and
/// the fixed `return 66` completion sentinel.
pub fn emit_body(sequence: &CallSequence, surface: &ApiSurface) -> Result<String, BodyEmitError> {
    let mut out = String::new();
    out.push_str(&format!("#include <{}>\n", surface.header));
    let needs_memset = sequence
        .instance_types
        .iter()
        .any(|ht| {
            surface
                .try_handle_type(*ht)
                .is_some_and(|t| t.storage == HandleStorage::Value)
        });
    if needs_memset {
        out.push_str("#include <string.h>\n");
    }
    out.push('\n');
    out.push_str("int run_sequence(void) {\n");

    let mut last_marker = "";
    for call in &sequence.calls {
        let desc = surface.calls.get(call.descriptor).ok_or_else(|| {
            BodyEmitError::UnknownDescriptor(call.name.clone(), call.descriptor)
        })?;
        let marker = phase_marker(desc.class);
        if marker != last_marker {
            out.push_str(marker);
            out.push('\n');
            last_marker = marker;
        }

        // Out-parameter handles are declared before the call.
        for arg in &call.args {
            if let BoundArg::OutHandle(id) = arg {
                let ht = handle_type_of(*id, sequence, surface)?;
                match ht.storage {
                    HandleStorage::Pointer => {
                        out.push_str(&format!("    {} *{id} = NULL;\n", ht.c_type));
                    }
                    HandleStorage::Value => {
                        out.push_str(&format!("    {} {id};\n", ht.c_type));
                        out.push_str(&format!("    memset(&{id}, 0, sizeof({id}));\n"));
                    }
                }
            }
        }

        let args: Vec<String> = call
            .args
            .iter()
            .map(|a| render_arg(a, sequence, surface))
            .collect::<Result<_, _>>()?;
        let invocation = format!("{}({})", call.name, args.join(", "));

        match (&call.ret_handle, &desc.ret, desc.class) {
            (Some(id), _, _) => {
                let ht = handle_type_of(*id, sequence, surface)?;
                out.push_str(&format!("    {} *{id} = {invocation};\n", ht.c_type));
                out.push_str(&format!("    if (!{id}) {{ return 1; }}\n"));
            }
            (None, ReturnRole::Status, CallClass::Create) => {
                out.push_str(&format!("    if ({invocation} != 0) {{ return 1; }}\n"));
            }
            _ => {
                out.push_str(&format!("    {invocation};\n"));
            }
        }
    }

    out.push_str("    return 66;\n}\n");
    Ok(out)
}
