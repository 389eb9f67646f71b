use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised when looking up or interrogating an API surface.
#[derive(Error, Debug)]
pub enum SurfaceError {
    /// The requested library is not registered with this registry.
    #[error("Unknown library '{0}', no API surface registered")]
    UnknownLibrary(String),
}

/// Index of a [`HandleType`] within its owning [`ApiSurface`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct HandleTypeId(pub usize);

/// Whether multiple live references to one handle may exist, or exactly
/// one owner is expected at any time. A `Unique` handle binds to at most
/// one parameter of a call; `Aliased` handles may be passed to several
/// parameters of the same call. Synthesis and validation both enforce
/// this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleSemantics {
    Unique,
    Aliased,
}

/// How a handle is held in emitted C code. Pointer handles are declared as
/// `T *hN` and consumed by value; value handles (e.g. a `z_stream`) are
/// declared inline and consumed by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStorage {
    Pointer,
    Value,
}

/// One opaque resource category exposed by a target library.
#[derive(Debug, Clone)]
pub struct HandleType {
    pub name: &'static str,
    /// The C type spelled without the trailing `*` for pointer storage.
    pub c_type: &'static str,
    pub semantics: HandleSemantics,
    pub storage: HandleStorage,
}

/// Scalar argument categories. Concrete values are drawn from a small fixed
/// pool per kind at synthesis time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Int,
    Size,
    CString,
    Buffer,
    Double,
}

/// Declared role of one parameter of a library function. Roles are stated
/// explicitly per descriptor, never inferred from the signature.
#[derive(Debug, Clone)]
pub enum ParamRole {
    /// Must be bound to a live instance of the given handle type.
    ConsumesHandle(HandleTypeId),
    /// Out-parameter that yields a fresh instance of the given handle type.
    ProducesHandle(HandleTypeId),
    /// Plain scalar or buffer argument.
    Scalar(ScalarKind),
    /// Fixed creation argument such as a version string or struct size,
    /// emitted verbatim (e.g. `ZLIB_VERSION`).
    Fixed(&'static str),
}

/// Declared role of the return value.
#[derive(Debug, Clone)]
pub enum ReturnRole {
    ProducesHandle(HandleTypeId),
    Status,
    Void,
}

/// Which lifecycle phase a call belongs to. Drives both the tracker
/// transition applied when the call is bound and the phase markers in the
/// emitted seed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Create,
    Configure,
    Operate,
    Validate,
    Cleanup,
}

/// One library function abstracted to parameter and return roles.
#[derive(Debug, Clone)]
pub struct ApiCallDescriptor {
    pub name: &'static str,
    pub params: Vec<ParamRole>,
    pub ret: ReturnRole,
    pub class: CallClass,
    /// Lifecycle-terminal or memory-safety sensitive (free/close/delete
    /// class operations).
    pub critical: bool,
    /// Static upper-bound estimate of instrumented branches reachable
    /// through this call. Feeds the density denominator and the guided
    /// selection weights.
    pub branch_weight: u32,
}

impl ApiCallDescriptor {
    /// Handle types this call produces, via return value or out-parameter.
    pub fn produced_types(&self) -> Vec<HandleTypeId> {
        let mut out = Vec::new();
        if let ReturnRole::ProducesHandle(ht) = self.ret {
            out.push(ht);
        }
        for p in &self.params {
            if let ParamRole::ProducesHandle(ht) = p {
                out.push(*ht);
            }
        }
        out
    }

    /// Handle types this call must bind to live instances.
    pub fn consumed_types(&self) -> Vec<HandleTypeId> {
        self.params
            .iter()
            .filter_map(|p| match p {
                ParamRole::ConsumesHandle(ht) => Some(*ht),
                _ => None,
            })
            .collect()
    }

    /// The synthetic branch identifier pool for this descriptor. The trace
    /// contract only requires opaque identifiers; one stable id per
    /// estimated branch keeps scoring deterministic.
    pub fn branch_ids(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.branch_weight).map(move |i| format!("{}#{}", self.name, i))
    }
}

/// Immutable description of one target library: its opaque handle types and
/// the calls the synthesizer may draw from.
#[derive(Debug, Clone)]
pub struct ApiSurface {
    pub library: &'static str,
    /// Public header the emitted seed body is written against.
    pub header: &'static str,
    pub handle_types: Vec<HandleType>,
    pub calls: Vec<ApiCallDescriptor>,
}

impl ApiSurface {
    pub fn handle_type(&self, id: HandleTypeId) -> &HandleType {
        &self.handle_types[id.0]
    }

    /// Lookup for ids carried by persisted sequences, which may be corrupt.
    pub fn try_handle_type(&self, id: HandleTypeId) -> Option<&HandleType> {
        self.handle_types.get(id.0)
    }

    pub fn descriptor(&self, index: usize) -> &ApiCallDescriptor {
        &self.calls[index]
    }

    /// Indices of cleanup-class calls that consume the given handle type.
    pub fn destroyers_of(&self, ht: HandleTypeId) -> Vec<usize> {
        self.calls
            .iter()
            .enumerate()
            .filter(|(_, d)| d.class == CallClass::Cleanup && d.consumed_types().contains(&ht))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Registry of API surfaces, selected by library id from configuration.
/// Loaded once and treated as immutable.
#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<String, Arc<ApiSurface>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in target library surfaces.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        for surface in builtin_surfaces() {
            reg.register(surface);
        }
        reg
    }

    pub fn register(&mut self, surface: ApiSurface) {
        self.surfaces
            .insert(surface.library.to_string(), Arc::new(surface));
    }

    /// Looks up the surface for a library id. No side effects.
    pub fn describe(&self, library_id: &str) -> Result<Arc<ApiSurface>, SurfaceError> {
        self.surfaces
            .get(library_id)
            .cloned()
            .ok_or_else(|| SurfaceError::UnknownLibrary(library_id.to_string()))
    }

    pub fn library_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.surfaces.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn cjson_surface() -> ApiSurface {
    let node = HandleTypeId(0);
    ApiSurface {
        library: "cjson",
        header: "cJSON.h",
        handle_types: vec![HandleType {
            name: "JSON node",
            c_type: "cJSON",
            semantics: HandleSemantics::Unique,
            storage: HandleStorage::Pointer,
        }],
        calls: vec![
            ApiCallDescriptor {
                name: "cJSON_CreateObject",
                params: vec![],
                ret: ReturnRole::ProducesHandle(node),
                class: CallClass::Create,
                critical: false,
                branch_weight: 4,
            },
            ApiCallDescriptor {
                name: "cJSON_AddNumberToObject",
                params: vec![
                    ParamRole::ConsumesHandle(node),
                    ParamRole::Scalar(ScalarKind::CString),
                    ParamRole::Scalar(ScalarKind::Double),
                ],
                ret: ReturnRole::Status,
                class: CallClass::Configure,
                critical: false,
                branch_weight: 12,
            },
            ApiCallDescriptor {
                name: "cJSON_AddStringToObject",
                params: vec![
                    ParamRole::ConsumesHandle(node),
                    ParamRole::Scalar(ScalarKind::CString),
                    ParamRole::Scalar(ScalarKind::CString),
                ],
                ret: ReturnRole::Status,
                class: CallClass::Configure,
                critical: false,
                branch_weight: 12,
            },
            ApiCallDescriptor {
                name: "cJSON_PrintUnformatted",
                params: vec![ParamRole::ConsumesHandle(node)],
                ret: ReturnRole::Status,
                class: CallClass::Operate,
                critical: false,
                branch_weight: 24,
            },
            ApiCallDescriptor {
                name: "cJSON_IsObject",
                params: vec![ParamRole::ConsumesHandle(node)],
                ret: ReturnRole::Status,
                class: CallClass::Validate,
                critical: false,
                branch_weight: 3,
            },
            ApiCallDescriptor {
                name: "cJSON_Delete",
                params: vec![ParamRole::ConsumesHandle(node)],
                ret: ReturnRole::Void,
                class: CallClass::Cleanup,
                critical: true,
                branch_weight: 8,
            },
        ],
    }
}

fn zlib_surface() -> ApiSurface {
    let strm = HandleTypeId(0);
    ApiSurface {
        library: "zlib",
        header: "zlib.h",
        handle_types: vec![HandleType {
            name: "z-stream",
            c_type: "z_stream",
            semantics: HandleSemantics::Unique,
            storage: HandleStorage::Value,
        }],
        calls: vec![
            ApiCallDescriptor {
                name: "deflateInit_",
                params: vec![
                    ParamRole::ProducesHandle(strm),
                    ParamRole::Scalar(ScalarKind::Int),
                    ParamRole::Fixed("ZLIB_VERSION"),
                    ParamRole::Fixed("(int)sizeof(z_stream)"),
                ],
                ret: ReturnRole::Status,
                class: CallClass::Create,
                critical: false,
                branch_weight: 10,
            },
            ApiCallDescriptor {
                name: "deflateParams",
                params: vec![
                    ParamRole::ConsumesHandle(strm),
                    ParamRole::Scalar(ScalarKind::Int),
                    ParamRole::Fixed("Z_DEFAULT_STRATEGY"),
                ],
                ret: ReturnRole::Status,
                class: CallClass::Configure,
                critical: false,
                branch_weight: 14,
            },
            ApiCallDescriptor {
                name: "deflate",
                params: vec![ParamRole::ConsumesHandle(strm), ParamRole::Fixed("Z_FINISH")],
                ret: ReturnRole::Status,
                class: CallClass::Operate,
                critical: false,
                branch_weight: 40,
            },
            ApiCallDescriptor {
                name: "deflateBound",
                params: vec![ParamRole::ConsumesHandle(strm), ParamRole::Scalar(ScalarKind::Size)],
                ret: ReturnRole::Status,
                class: CallClass::Validate,
                critical: false,
                branch_weight: 6,
            },
            ApiCallDescriptor {
                name: "deflateEnd",
                params: vec![ParamRole::ConsumesHandle(strm)],
                ret: ReturnRole::Status,
                class: CallClass::Cleanup,
                critical: true,
                branch_weight: 8,
            },
        ],
    }
}

fn sqlite_surface() -> ApiSurface {
    let db = HandleTypeId(0);
    let stmt = HandleTypeId(1);
    ApiSurface {
        library: "sqlite3",
        header: "sqlite3.h",
        handle_types: vec![
            HandleType {
                name: "database connection",
                c_type: "sqlite3",
                semantics: HandleSemantics::Unique,
                storage: HandleStorage::Pointer,
            },
            HandleType {
                name: "prepared statement",
                c_type: "sqlite3_stmt",
                semantics: HandleSemantics::Unique,
                storage: HandleStorage::Pointer,
            },
        ],
        calls: vec![
            ApiCallDescriptor {
                name: "sqlite3_open",
                params: vec![ParamRole::Fixed("\":memory:\""), ParamRole::ProducesHandle(db)],
                ret: ReturnRole::Status,
                class: CallClass::Create,
                critical: false,
                branch_weight: 18,
            },
            ApiCallDescriptor {
                name: "sqlite3_busy_timeout",
                params: vec![ParamRole::ConsumesHandle(db), ParamRole::Scalar(ScalarKind::Int)],
                ret: ReturnRole::Status,
                class: CallClass::Configure,
                critical: false,
                branch_weight: 6,
            },
            ApiCallDescriptor {
                name: "sqlite3_prepare_v2",
                params: vec![
                    ParamRole::ConsumesHandle(db),
                    ParamRole::Fixed("\"SELECT 1\""),
                    ParamRole::Fixed("-1"),
                    ParamRole::ProducesHandle(stmt),
                    ParamRole::Fixed("NULL"),
                ],
                ret: ReturnRole::Status,
                class: CallClass::Create,
                critical: false,
                branch_weight: 30,
            },
            ApiCallDescriptor {
                name: "sqlite3_step",
                params: vec![ParamRole::ConsumesHandle(stmt)],
                ret: ReturnRole::Status,
                class: CallClass::Operate,
                critical: false,
                branch_weight: 36,
            },
            ApiCallDescriptor {
                name: "sqlite3_column_count",
                params: vec![ParamRole::ConsumesHandle(stmt)],
                ret: ReturnRole::Status,
                class: CallClass::Validate,
                critical: false,
                branch_weight: 4,
            },
            ApiCallDescriptor {
                name: "sqlite3_finalize",
                params: vec![ParamRole::ConsumesHandle(stmt)],
                ret: ReturnRole::Status,
                class: CallClass::Cleanup,
                critical: true,
                branch_weight: 10,
            },
            ApiCallDescriptor {
                name: "sqlite3_close",
                params: vec![ParamRole::ConsumesHandle(db)],
                ret: ReturnRole::Status,
                class: CallClass::Cleanup,
                critical: true,
                branch_weight: 12,
            },
        ],
    }
}

fn re2_surface() -> ApiSurface {
    let rex = HandleTypeId(0);
    ApiSurface {
        library: "re2",
        header: "cre2.h",
        handle_types: vec![HandleType {
            name: "regex object",
            c_type: "cre2_regexp_t",
            semantics: HandleSemantics::Unique,
            storage: HandleStorage::Pointer,
        }],
        calls: vec![
            ApiCallDescriptor {
                name: "cre2_new",
                params: vec![
                    ParamRole::Scalar(ScalarKind::CString),
                    ParamRole::Scalar(ScalarKind::Size),
                    ParamRole::Fixed("NULL"),
                ],
                ret: ReturnRole::ProducesHandle(rex),
                class: CallClass::Create,
                critical: false,
                branch_weight: 22,
            },
            ApiCallDescriptor {
                name: "cre2_num_capturing_groups",
                params: vec![ParamRole::ConsumesHandle(rex)],
                ret: ReturnRole::Status,
                class: CallClass::Validate,
                critical: false,
                branch_weight: 4,
            },
            ApiCallDescriptor {
                name: "cre2_match",
                params: vec![
                    ParamRole::ConsumesHandle(rex),
                    ParamRole::Scalar(ScalarKind::CString),
                    ParamRole::Scalar(ScalarKind::Size),
                    ParamRole::Fixed("0"),
                    ParamRole::Scalar(ScalarKind::Size),
                    ParamRole::Fixed("CRE2_UNANCHORED"),
                    ParamRole::Fixed("NULL"),
                    ParamRole::Fixed("0"),
                ],
                ret: ReturnRole::Status,
                class: CallClass::Operate,
                critical: false,
                branch_weight: 34,
            },
            ApiCallDescriptor {
                name: "cre2_delete",
                params: vec![ParamRole::ConsumesHandle(rex)],
                ret: ReturnRole::Void,
                class: CallClass::Cleanup,
                critical: true,
                branch_weight: 6,
            },
        ],
    }
}

fn libpng_surface() -> ApiSurface {
    let png = HandleTypeId(0);
    ApiSurface {
        library: "libpng",
        header: "png.h",
        handle_types: vec![HandleType {
            name: "PNG write struct",
            c_type: "png_struct",
            semantics: HandleSemantics::Unique,
            storage: HandleStorage::Pointer,
        }],
        calls: vec![
            ApiCallDescriptor {
                name: "png_create_write_struct",
                params: vec![
                    ParamRole::Fixed("PNG_LIBPNG_VER_STRING"),
                    ParamRole::Fixed("NULL"),
                    ParamRole::Fixed("NULL"),
                    ParamRole::Fixed("NULL"),
                ],
                ret: ReturnRole::ProducesHandle(png),
                class: CallClass::Create,
                critical: false,
                branch_weight: 14,
            },
            ApiCallDescriptor {
                name: "png_set_compression_level",
                params: vec![ParamRole::ConsumesHandle(png), ParamRole::Scalar(ScalarKind::Int)],
                ret: ReturnRole::Void,
                class: CallClass::Configure,
                critical: false,
                branch_weight: 6,
            },
            ApiCallDescriptor {
                name: "png_get_compression_buffer_size",
                params: vec![ParamRole::ConsumesHandle(png)],
                ret: ReturnRole::Status,
                class: CallClass::Validate,
                critical: false,
                branch_weight: 4,
            },
            ApiCallDescriptor {
                name: "png_destroy_write_struct",
                params: vec![ParamRole::ConsumesHandle(png), ParamRole::Fixed("NULL")],
                ret: ReturnRole::Void,
                class: CallClass::Cleanup,
                critical: true,
                branch_weight: 10,
            },
        ],
    }
}

fn lcms_surface() -> ApiSurface {
    let profile = HandleTypeId(0);
    ApiSurface {
        library: "lcms2",
        header: "lcms2.h",
        handle_types: vec![HandleType {
            name: "color profile",
            c_type: "void",
            semantics: HandleSemantics::Unique,
            storage: HandleStorage::Pointer,
        }],
        calls: vec![
            ApiCallDescriptor {
                name: "cmsCreate_sRGBProfile",
                params: vec![],
                ret: ReturnRole::ProducesHandle(profile),
                class: CallClass::Create,
                critical: false,
                branch_weight: 20,
            },
            ApiCallDescriptor {
                name: "cmsSetProfileVersion",
                params: vec![ParamRole::ConsumesHandle(profile), ParamRole::Scalar(ScalarKind::Double)],
                ret: ReturnRole::Void,
                class: CallClass::Configure,
                critical: false,
                branch_weight: 5,
            },
            ApiCallDescriptor {
                name: "cmsGetColorSpace",
                params: vec![ParamRole::ConsumesHandle(profile)],
                ret: ReturnRole::Status,
                class: CallClass::Operate,
                critical: false,
                branch_weight: 8,
            },
            ApiCallDescriptor {
                name: "cmsGetProfileVersion",
                params: vec![ParamRole::ConsumesHandle(profile)],
                ret: ReturnRole::Status,
                class: CallClass::Validate,
                critical: false,
                branch_weight: 4,
            },
            ApiCallDescriptor {
                name: "cmsCloseProfile",
                params: vec![ParamRole::ConsumesHandle(profile)],
                ret: ReturnRole::Status,
                class: CallClass::Cleanup,
                critical: true,
                branch_weight: 12,
            },
        ],
    }
}

fn libpcap_surface() -> ApiSurface {
    let cap = HandleTypeId(0);
    ApiSurface {
        library: "libpcap",
        header: "pcap/pcap.h",
        handle_types: vec![HandleType {
            name: "capture handle",
            c_type: "pcap_t",
            semantics: HandleSemantics::Unique,
            storage: HandleStorage::Pointer,
        }],
        calls: vec![
            ApiCallDescriptor {
                name: "pcap_open_dead",
                params: vec![ParamRole::Fixed("DLT_EN10MB"), ParamRole::Scalar(ScalarKind::Int)],
                ret: ReturnRole::ProducesHandle(cap),
                class: CallClass::Create,
                critical: false,
                branch_weight: 8,
            },
            ApiCallDescriptor {
                name: "pcap_snapshot",
                params: vec![ParamRole::ConsumesHandle(cap)],
                ret: ReturnRole::Status,
                class: CallClass::Operate,
                critical: false,
                branch_weight: 4,
            },
            ApiCallDescriptor {
                name: "pcap_datalink",
                params: vec![ParamRole::ConsumesHandle(cap)],
                ret: ReturnRole::Status,
                class: CallClass::Validate,
                critical: false,
                branch_weight: 4,
            },
            ApiCallDescriptor {
                name: "pcap_close",
                params: vec![ParamRole::ConsumesHandle(cap)],
                ret: ReturnRole::Void,
                class: CallClass::Cleanup,
                critical: true,
                branch_weight: 8,
            },
        ],
    }
}

/// The built-in target library surfaces. Each is a representative subset of
/// the public C ABI with lifecycle roles declared descriptor by descriptor.
pub fn builtin_surfaces() -> Vec<ApiSurface> {
    vec![
        cjson_surface(),
        zlib_surface(),
        sqlite_surface(),
        re2_surface(),
        libpng_surface(),
        lcms_surface(),
        libpcap_surface(),
    ]
}
