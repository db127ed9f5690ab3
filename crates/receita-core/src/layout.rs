//! Record layouts and the registry that maps record types to them.
//!
//! A layout is the fixed, ordered column list of one publisher record type
//! together with its destination table. The column name prefix carries the
//! semantic type (`st_` string, `cd_` code, `vl_` numeric, `dt_` date).
//!
//! The registry is built once at start-up and only read afterwards, so it is
//! shared by reference (or `Arc`) without locking.

use crate::error::AppError;
use crate::models::FileEntry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Semantic type of a layout column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Code,
    Numeric,
    Date,
}

impl ColumnKind {
    /// Infers the semantic type from the column name prefix.
    pub fn from_column_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("dt_") {
            ColumnKind::Date
        } else if lower.starts_with("cd_") {
            ColumnKind::Code
        } else if lower.starts_with("vl_") {
            ColumnKind::Numeric
        } else {
            ColumnKind::Text
        }
    }

    /// SQL type used when the destination table is created.
    ///
    /// Numeric values arrive with a comma decimal separator and are stored verbatim.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Date => "DATE",
            ColumnKind::Text | ColumnKind::Code | ColumnKind::Numeric => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

/// Ordered column schema for one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Upper-case record-type identifier, e.g. `EMPRESAS`.
    pub record_type: String,
    /// Destination table name (unqualified).
    pub table: String,
    pub columns: Vec<Column>,
}

impl Layout {
    pub fn new(record_type: &str, table: &str, columns: &[&str]) -> Self {
        Self {
            record_type: record_type.to_uppercase(),
            table: table.to_string(),
            columns: columns
                .iter()
                .map(|name| Column {
                    name: name.to_string(),
                    kind: ColumnKind::from_column_name(name),
                })
                .collect(),
        }
    }

    /// Number of fields every source row must carry.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Positions of the date columns, in column order.
    pub fn date_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ColumnKind::Date)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

/// Equality-lookup index created by the index builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub column: String,
}

impl IndexSpec {
    pub fn new(name: &str, table: &str, column: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            column: column.to_string(),
        }
    }
}

/// Layout definition as written in a settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutSpec {
    pub record_type: String,
    pub table: String,
    pub columns: Vec<String>,
}

impl From<&LayoutSpec> for Layout {
    fn from(spec: &LayoutSpec) -> Self {
        let columns: Vec<&str> = spec.columns.iter().map(String::as_str).collect();
        Layout::new(&spec.record_type, &spec.table, &columns)
    }
}

/// Immutable mapping from record-type identifier to layout.
#[derive(Debug, Clone)]
pub struct LayoutRegistry {
    layouts: HashMap<String, Layout>,
    indexes: Vec<IndexSpec>,
}

impl LayoutRegistry {
    /// Builds a registry, rejecting duplicate record types, unsafe SQL
    /// identifiers and indexes that point at unknown columns.
    pub fn new(layouts: Vec<Layout>, indexes: Vec<IndexSpec>) -> Result<Self, AppError> {
        let mut map = HashMap::with_capacity(layouts.len());

        for layout in layouts {
            if layout.columns.is_empty() {
                return Err(AppError::ConfigError(format!(
                    "layout {} has no columns",
                    layout.record_type
                )));
            }
            ensure_identifier(&layout.table)?;
            for column in &layout.columns {
                ensure_identifier(&column.name)?;
            }
            if map.contains_key(&layout.record_type) {
                return Err(AppError::ConfigError(format!(
                    "layout {} defined twice",
                    layout.record_type
                )));
            }
            map.insert(layout.record_type.clone(), layout);
        }

        for index in &indexes {
            ensure_identifier(&index.name)?;
            let known = map
                .values()
                .any(|l| l.table == index.table && l.has_column(&index.column));
            if !known {
                return Err(AppError::ConfigError(format!(
                    "index {} refers to unknown column {}.{}",
                    index.name, index.table, index.column
                )));
            }
        }

        Ok(Self {
            layouts: map,
            indexes,
        })
    }

    /// Layouts of the federal company registry (CNPJ) open-data release.
    pub fn cnpj() -> Self {
        let layouts = vec![
            Layout::new(
                "EMPRESAS",
                "tb_empresa",
                &[
                    "st_cnpj_base",
                    "st_razao_social",
                    "cd_natureza_juridica",
                    "cd_qualificacao",
                    "vl_capital_social",
                    "cd_porte_empresa",
                    "st_ente_federativo",
                ],
            ),
            Layout::new(
                "ESTABELECIMENTOS",
                "tb_estabelecimento",
                &[
                    "st_cnpj_base",
                    "st_cnpj_ordem",
                    "st_cnpj_dv",
                    "cd_matriz_filial",
                    "st_nome_fantasia",
                    "cd_situacao_cadastral",
                    "dt_situacao_cadastral",
                    "cd_motivo_situacao_cadastral",
                    "st_cidade_exterior",
                    "cd_pais",
                    "dt_inicio_atividade",
                    "cd_cnae_principal",
                    "cd_cnae_secundario",
                    "st_tipo_logradouro",
                    "st_logradouro",
                    "st_numero",
                    "st_complemento",
                    "st_bairro",
                    "st_cep",
                    "st_uf",
                    "cd_municipio",
                    "st_ddd1",
                    "st_telefone1",
                    "st_ddd2",
                    "st_telefone2",
                    "st_ddd_fax",
                    "st_fax",
                    "st_email",
                    "st_situacao_especial",
                    "dt_situacao_especial",
                ],
            ),
            Layout::new(
                "SIMPLES",
                "tb_dados_simples",
                &[
                    "st_cnpj_base",
                    "st_opcao_simples",
                    "dt_opcao_simples",
                    "dt_exclusao_simples",
                    "st_opcao_mei",
                    "dt_opcao_mei",
                    "dt_exclusao_mei",
                ],
            ),
            Layout::new(
                "SOCIOS",
                "tb_socio",
                &[
                    "st_cnpj_base",
                    "cd_tipo",
                    "st_nome",
                    "st_cpf_cnpj",
                    "cd_qualificacao",
                    "dt_entrada",
                    "cd_pais",
                    "st_representante",
                    "st_nome_representante",
                    "cd_qualificacao_representante",
                    "cd_faixa_etaria",
                ],
            ),
            Layout::new("PAISES", "tb_pais", &["cd_pais", "st_pais"]),
            Layout::new("MUNICIPIOS", "tb_municipio", &["cd_municipio", "st_municipio"]),
            Layout::new(
                "QUALIFICACOES",
                "tb_qualificacao_socio",
                &["cd_qualificacao", "st_qualificacao"],
            ),
            Layout::new(
                "NATUREZAS",
                "tb_natureza_juridica",
                &["cd_natureza_juridica", "st_natureza_juridica"],
            ),
            Layout::new(
                "MOTIVOS",
                "tb_motivo_situacao_cadastral",
                &["cd_motivo_situacao_cadastral", "st_motivo_situacao_cadastral"],
            ),
            Layout::new("CNAES", "tb_cnae", &["cd_cnae", "st_cnae"]),
        ];

        let indexes = vec![
            IndexSpec::new("ix_estab_cnpj_base", "tb_estabelecimento", "st_cnpj_base"),
            IndexSpec::new("ix_estab_nome_fantasia", "tb_estabelecimento", "st_nome_fantasia"),
            IndexSpec::new("ix_estab_uf", "tb_estabelecimento", "st_uf"),
            IndexSpec::new("ix_estab_municipio", "tb_estabelecimento", "cd_municipio"),
            IndexSpec::new("ix_muni_cod_municipio", "tb_municipio", "cd_municipio"),
            IndexSpec::new("ix_muni_municipio", "tb_municipio", "st_municipio"),
            IndexSpec::new("ix_simples_cnpj_base", "tb_dados_simples", "st_cnpj_base"),
            IndexSpec::new("ix_empresa_cnpj_base", "tb_empresa", "st_cnpj_base"),
            IndexSpec::new("ix_socio_cnpj_base", "tb_socio", "st_cnpj_base"),
            IndexSpec::new("ix_empresa_razao_social", "tb_empresa", "st_razao_social"),
        ];

        Self {
            layouts: layouts
                .into_iter()
                .map(|l| (l.record_type.clone(), l))
                .collect(),
            indexes,
        }
    }

    pub fn get(&self, record_type: &str) -> Option<&Layout> {
        self.layouts.get(record_type)
    }

    /// Resolves the layout for a file entry.
    pub fn resolve(&self, entry: &FileEntry) -> Result<&Layout, AppError> {
        self.get(&entry.record_type)
            .ok_or_else(|| AppError::UnknownLayout {
                name: entry.name.clone(),
            })
    }

    /// All layouts, sorted by record type.
    pub fn layouts(&self) -> Vec<&Layout> {
        let mut layouts: Vec<&Layout> = self.layouts.values().collect();
        layouts.sort_by(|a, b| a.record_type.cmp(&b.record_type));
        layouts
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Distinct layouts referenced by the given entries, sorted by table name.
    /// Entries without a layout are ignored.
    pub fn layouts_for<'a>(&self, entries: impl IntoIterator<Item = &'a FileEntry>) -> Vec<&Layout> {
        let record_types: BTreeSet<&str> = entries
            .into_iter()
            .map(|e| e.record_type.as_str())
            .collect();
        let mut layouts: Vec<&Layout> = record_types
            .into_iter()
            .filter_map(|rt| self.get(rt))
            .collect();
        layouts.sort_by(|a, b| a.table.cmp(&b.table));
        layouts.dedup_by(|a, b| a.table == b.table);
        layouts
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

/// Accepts lower-case SQL identifiers only; they are interpolated into DDL.
fn ensure_identifier(name: &str) -> Result<(), AppError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(AppError::ConfigError(format!(
            "invalid SQL identifier: {:?}",
            name
        )))
    }
}
