//! 内存存储网关实现
//! In-memory store gateway implementation
//!
//! 在一把写锁下求值条件更新，因此认领具备与真实存储相同的原子性。查询求值
//! 覆盖调度器实际发出的算子集合。
//! Conditional updates are evaluated under one write lock, so claims have the
//! same atomicity as the real store. Query evaluation covers the operator set
//! the scheduler actually issues.

use crate::base::{FindAndUpdateOptions, JobStore};
use crate::error::Result;
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use std::cmp::Ordering;
use tokio::sync::RwLock;

/// 内存任务存储
/// In-memory job store
#[derive(Default)]
pub struct MemoryStore {
  documents: RwLock<Vec<Document>>,
}

impl MemoryStore {
  /// 创建空存储
  /// Create an empty store
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl JobStore for MemoryStore {
  async fn find_one_and_update(
    &self,
    filter: Document,
    update: Document,
    options: FindAndUpdateOptions,
  ) -> Result<Option<Document>> {
    let mut documents = self.documents.write().await;
    let mut matches: Vec<usize> = documents
      .iter()
      .enumerate()
      .filter(|(_, document)| matches_filter(document, &filter))
      .map(|(index, _)| index)
      .collect();
    if let Some(sort) = &options.sort {
      matches.sort_by(|&a, &b| compare_documents(&documents[a], &documents[b], sort));
    }

    if let Some(&index) = matches.first() {
      apply_update(&mut documents[index], &update, false);
      return Ok(Some(documents[index].clone()));
    }

    if options.upsert {
      let mut document = upsert_seed(&filter);
      apply_update(&mut document, &update, true);
      if !document.contains_key("_id") {
        document.insert("_id", ObjectId::new());
      }
      documents.push(document.clone());
      return Ok(Some(document));
    }
    Ok(None)
  }

  async fn find(&self, filter: Document) -> Result<Vec<Document>> {
    let documents = self.documents.read().await;
    Ok(
      documents
        .iter()
        .filter(|document| matches_filter(document, &filter))
        .cloned()
        .collect(),
    )
  }

  async fn insert_one(&self, mut document: Document) -> Result<Document> {
    if !document.contains_key("_id") {
      document.insert("_id", ObjectId::new());
    }
    self.documents.write().await.push(document.clone());
    Ok(document)
  }

  async fn update_many(&self, filter: Document, update: Document) -> Result<u64> {
    let mut documents = self.documents.write().await;
    let mut updated = 0;
    for document in documents.iter_mut() {
      if matches_filter(document, &filter) {
        apply_update(document, &update, false);
        updated += 1;
      }
    }
    Ok(updated)
  }

  async fn delete_many(&self, filter: Document) -> Result<u64> {
    let mut documents = self.documents.write().await;
    let before = documents.len();
    documents.retain(|document| !matches_filter(document, &filter));
    Ok((before - documents.len()) as u64)
  }

  async fn ensure_indexes(&self) {}
}

fn matches_filter(document: &Document, filter: &Document) -> bool {
  filter.iter().all(|(key, condition)| match key.as_str() {
    "$or" => match condition {
      Bson::Array(branches) => branches.iter().any(|branch| {
        branch
          .as_document()
          .map(|branch| matches_filter(document, branch))
          .unwrap_or(false)
      }),
      _ => false,
    },
    path => field_matches(lookup_path(document, path), condition),
  })
}

/// 支持点号路径的字段查找
/// Field lookup with dotted-path support
fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
  let mut parts = path.split('.');
  let mut current = document.get(parts.next()?)?;
  for part in parts {
    current = current.as_document()?.get(part)?;
  }
  Some(current)
}

fn is_operator_document(condition: &Bson) -> bool {
  matches!(condition, Bson::Document(operators) if operators.keys().any(|key| key.starts_with('$')))
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> bool {
  if let Bson::Document(operators) = condition {
    if operators.keys().any(|key| key.starts_with('$')) {
      return operators
        .iter()
        .all(|(operator, operand)| operator_matches(value, operator, operand));
    }
  }
  equals(value, condition)
}

fn operator_matches(value: Option<&Bson>, operator: &str, operand: &Bson) -> bool {
  match operator {
    "$lt" => compare_with(value, operand) == Some(Ordering::Less),
    "$lte" => matches!(
      compare_with(value, operand),
      Some(Ordering::Less | Ordering::Equal)
    ),
    "$gt" => compare_with(value, operand) == Some(Ordering::Greater),
    "$gte" => matches!(
      compare_with(value, operand),
      Some(Ordering::Greater | Ordering::Equal)
    ),
    "$ne" => !equals(value, operand),
    "$exists" => operand
      .as_bool()
      .map(|wanted| value.is_some() == wanted)
      .unwrap_or(false),
    "$in" => operand
      .as_array()
      .map(|items| items.iter().any(|item| equals(value, item)))
      .unwrap_or(false),
    "$nin" => operand
      .as_array()
      .map(|items| !items.iter().any(|item| equals(value, item)))
      .unwrap_or(false),
    _ => false,
  }
}

fn compare_with(value: Option<&Bson>, operand: &Bson) -> Option<Ordering> {
  compare_bson(value?, operand)
}

/// 等值比较，null 同时匹配显式 null 与字段缺失
/// Equality; null matches both an explicit null and an absent field
fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
  match value {
    None => matches!(expected, Bson::Null),
    Some(value) => match compare_bson(value, expected) {
      Some(ordering) => ordering == Ordering::Equal,
      None => value == expected,
    },
  }
}

fn compare_bson(a: &Bson, b: &Bson) -> Option<Ordering> {
  match (a, b) {
    (Bson::Int32(a), Bson::Int32(b)) => Some(a.cmp(b)),
    (Bson::Int64(a), Bson::Int64(b)) => Some(a.cmp(b)),
    (Bson::Int32(a), Bson::Int64(b)) => Some((*a as i64).cmp(b)),
    (Bson::Int64(a), Bson::Int32(b)) => Some(a.cmp(&(*b as i64))),
    (Bson::Double(a), Bson::Double(b)) => a.partial_cmp(b),
    (Bson::Double(a), Bson::Int32(b)) => a.partial_cmp(&(*b as f64)),
    (Bson::Double(a), Bson::Int64(b)) => a.partial_cmp(&(*b as f64)),
    (Bson::Int32(a), Bson::Double(b)) => (*a as f64).partial_cmp(b),
    (Bson::Int64(a), Bson::Double(b)) => (*a as f64).partial_cmp(b),
    (Bson::DateTime(a), Bson::DateTime(b)) => Some(a.cmp(b)),
    (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
    (Bson::Boolean(a), Bson::Boolean(b)) => Some(a.cmp(b)),
    (Bson::ObjectId(a), Bson::ObjectId(b)) => Some(a.bytes().cmp(&b.bytes())),
    (Bson::Null, Bson::Null) => Some(Ordering::Equal),
    _ => None,
  }
}

fn compare_documents(a: &Document, b: &Document, sort: &Document) -> Ordering {
  for (key, direction) in sort {
    let ordering = match (lookup_path(a, key), lookup_path(b, key)) {
      (Some(left), Some(right)) => compare_bson(left, right).unwrap_or(Ordering::Equal),
      (Some(_), None) => Ordering::Greater,
      (None, Some(_)) => Ordering::Less,
      (None, None) => Ordering::Equal,
    };
    let descending = matches!(direction, Bson::Int32(d) if *d < 0)
      || matches!(direction, Bson::Int64(d) if *d < 0)
      || matches!(direction, Bson::Double(d) if *d < 0.0);
    let ordering = if descending { ordering.reverse() } else { ordering };
    if ordering != Ordering::Equal {
      return ordering;
    }
  }
  Ordering::Equal
}

/// 将点号路径写入嵌套文档
/// Write a dotted path into nested documents
fn insert_path(document: &mut Document, path: &str, value: Bson) {
  match path.split_once('.') {
    None => {
      document.insert(path, value);
    }
    Some((head, rest)) => {
      if !matches!(document.get(head), Some(Bson::Document(_))) {
        document.insert(head, Document::new());
      }
      if let Some(Bson::Document(inner)) = document.get_mut(head) {
        insert_path(inner, rest, value);
      }
    }
  }
}

/// upsert 的种子文档：过滤器中的纯等值字段
/// Upsert seed document: the plain equality fields of the filter
fn upsert_seed(filter: &Document) -> Document {
  let mut seed = Document::new();
  for (key, condition) in filter {
    if key.starts_with('$') || is_operator_document(condition) {
      continue;
    }
    insert_path(&mut seed, key, condition.clone());
  }
  seed
}

fn apply_update(document: &mut Document, update: &Document, inserting: bool) {
  if let Some(Bson::Document(set)) = update.get("$set") {
    for (key, value) in set {
      document.insert(key.clone(), value.clone());
    }
  }
  if inserting {
    if let Some(Bson::Document(set)) = update.get("$setOnInsert") {
      for (key, value) in set {
        document.insert(key.clone(), value.clone());
      }
    }
  }
}
