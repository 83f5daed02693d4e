//! # Entities
//!
//! An entity is the attribute set of one file or directory, identified by a
//! normalized [`EntityPath`].
//!
//! ## Sharing and Locking
//!
//! Entities are handed around as [`SharedEntity`] (`Arc<Entity>`): the query
//! engine, the attribute editor and the entity manager may all hold the same
//! instance. A [`FileEntity`] keeps its whole state behind one read/write
//! lock, so concurrent readers never block each other while a mutation is
//! exclusive.
//!
//! ```text
//! Arc<Entity>
//!   └─ File(FileEntity)
//!        └─ RwLock<FileState>
//!             ├─ path, last_write_ms, last_access_ms
//!             └─ BTreeMap<name, Attribute>
//! ```
//!
//! ## Invariants
//!
//! - Setting an attribute whose value is null removes it: "no entry" and
//!   "null value" are the same observable state
//! - `Clone` is deep: the copy shares no lock and no attribute with the
//!   original (the entity manager relies on this to snapshot state)
//! - Directories carry no attributes and list before files

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::attribute::Attribute;
use crate::error::{Error, Result};

/// Name of the attribute that holds an entity's thumbnail image.
pub const THUMBNAIL_ATTRIBUTE: &str = "thumbnail";

/// An entity shared between callers.
pub type SharedEntity = Arc<Entity>;

// =============================================================================
// Entity Path
// =============================================================================

/// A normalized, case-insensitive file system path.
///
/// # Normalization
///
/// - `\` separators become `/`
/// - repeated separators collapse into one
/// - trailing separators are trimmed (except for the root `/`)
///
/// Equality, hashing and ordering use a case-folded key; the display form
/// keeps the caller's casing.
///
/// # Example
///
/// ```rust
/// use attrcache::EntityPath;
///
/// let a = EntityPath::new("C:\\Photos\\IMG_01.JPG");
/// let b = EntityPath::new("c:/photos//img_01.jpg");
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "C:/Photos/IMG_01.JPG");
/// ```
#[derive(Debug, Clone)]
pub struct EntityPath {
    display: String,
    key: String,
}

impl EntityPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let raw = path.as_ref();
        let mut display = String::with_capacity(raw.len());
        let mut previous_was_separator = false;

        for c in raw.chars() {
            let c = if c == '\\' { '/' } else { c };
            if c == '/' {
                if previous_was_separator {
                    continue;
                }
                previous_was_separator = true;
            } else {
                previous_was_separator = false;
            }
            display.push(c);
        }

        while display.len() > 1 && display.ends_with('/') {
            display.pop();
        }

        let key = display.to_lowercase();
        Self { display, key }
    }

    /// The path as given by the caller, after separator normalization.
    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// The case-folded form used for identity and as the database key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The last path component.
    pub fn file_name(&self) -> &str {
        match self.display.rfind('/') {
            Some(i) if i + 1 < self.display.len() => &self.display[i + 1..],
            _ => &self.display,
        }
    }

    /// The containing directory, if the path has one.
    pub fn parent(&self) -> Option<EntityPath> {
        match self.display.rfind('/') {
            Some(0) if self.display.len() > 1 => Some(EntityPath::new("/")),
            Some(i) if i > 0 => Some(EntityPath::new(&self.display[..i])),
            _ => None,
        }
    }
}

impl PartialEq for EntityPath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for EntityPath {}

impl Hash for EntityPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for EntityPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl From<&str> for EntityPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntityPath {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&Path> for EntityPath {
    fn from(p: &Path) -> Self {
        Self::new(p.to_string_lossy())
    }
}

impl From<&EntityPath> for EntityPath {
    fn from(p: &EntityPath) -> Self {
        p.clone()
    }
}

// =============================================================================
// File Entity
// =============================================================================

#[derive(Debug, Clone)]
struct FileState {
    path: EntityPath,
    last_write_ms: u64,
    last_access_ms: u64,
    attributes: BTreeMap<String, Attribute>,
}

/// Attributes of a single file.
#[derive(Debug)]
pub struct FileEntity {
    state: RwLock<FileState>,
}

impl FileEntity {
    pub fn new(path: impl Into<EntityPath>) -> Self {
        Self {
            state: RwLock::new(FileState {
                path: path.into(),
                last_write_ms: 0,
                last_access_ms: 0,
                attributes: BTreeMap::new(),
            }),
        }
    }
}

impl Clone for FileEntity {
    fn clone(&self) -> Self {
        Self {
            state: RwLock::new(self.state.read().clone()),
        }
    }
}

// =============================================================================
// Directory Entity
// =============================================================================

/// A directory; it has a path but no attributes.
#[derive(Debug)]
pub struct DirectoryEntity {
    path: RwLock<EntityPath>,
}

impl DirectoryEntity {
    pub fn new(path: impl Into<EntityPath>) -> Self {
        Self {
            path: RwLock::new(path.into()),
        }
    }
}

impl Clone for DirectoryEntity {
    fn clone(&self) -> Self {
        Self::new(self.path.read().clone())
    }
}

// =============================================================================
// Entity
// =============================================================================

/// A file or directory together with its attributes.
#[derive(Debug, Clone)]
pub enum Entity {
    File(FileEntity),
    Directory(DirectoryEntity),
}

impl Entity {
    /// A new file entity with no attributes.
    pub fn file(path: impl Into<EntityPath>) -> Self {
        Entity::File(FileEntity::new(path))
    }

    pub fn directory(path: impl Into<EntityPath>) -> Self {
        Entity::Directory(DirectoryEntity::new(path))
    }

    /// Wraps the entity for sharing.
    pub fn into_shared(self) -> SharedEntity {
        Arc::new(self)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Entity::File(_))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Entity::Directory(_))
    }

    pub fn path(&self) -> EntityPath {
        match self {
            Entity::File(f) => f.state.read().path.clone(),
            Entity::Directory(d) => d.path.read().clone(),
        }
    }

    /// Relabels the entity after its file was moved or renamed.
    pub fn change_path(&self, path: impl Into<EntityPath>) {
        let path = path.into();
        match self {
            Entity::File(f) => f.state.write().path = path,
            Entity::Directory(d) => *d.path.write() = path,
        }
    }

    /// Last modification time of the underlying file, in ms since the epoch.
    /// Always 0 for directories.
    pub fn last_write_ms(&self) -> u64 {
        match self {
            Entity::File(f) => f.state.read().last_write_ms,
            Entity::Directory(_) => 0,
        }
    }

    pub fn set_last_write_ms(&self, ms: u64) {
        if let Entity::File(f) = self {
            f.state.write().last_write_ms = ms;
        }
    }

    /// Last time the entity was read from the cache, in ms since the epoch.
    pub fn last_access_ms(&self) -> u64 {
        match self {
            Entity::File(f) => f.state.read().last_access_ms,
            Entity::Directory(_) => 0,
        }
    }

    pub fn set_last_access_ms(&self, ms: u64) {
        if let Entity::File(f) = self {
            f.state.write().last_access_ms = ms;
        }
    }

    pub fn get_attribute(&self, name: &str) -> Option<Attribute> {
        match self {
            Entity::File(f) => f.state.read().attributes.get(name).cloned(),
            Entity::Directory(_) => None,
        }
    }

    /// Sets an attribute, replacing any attribute with the same name.
    ///
    /// A null value removes the attribute instead of storing it.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` on a directory entity.
    pub fn set_attribute(&self, attribute: Attribute) -> Result<()> {
        match self {
            Entity::File(f) => {
                let mut state = f.state.write();
                if attribute.value().is_null() {
                    state.attributes.remove(attribute.name());
                } else {
                    state
                        .attributes
                        .insert(attribute.name().to_string(), attribute);
                }
                Ok(())
            }
            Entity::Directory(d) => Err(Error::InvalidArgument(format!(
                "directory '{}' cannot hold attributes",
                d.path.read()
            ))),
        }
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Attribute> {
        match self {
            Entity::File(f) => f.state.write().attributes.remove(name),
            Entity::Directory(_) => None,
        }
    }

    /// Snapshot of all attributes, ordered by name.
    pub fn attributes(&self) -> Vec<Attribute> {
        match self {
            Entity::File(f) => f.state.read().attributes.values().cloned().collect(),
            Entity::Directory(_) => Vec::new(),
        }
    }

    pub fn attribute_count(&self) -> usize {
        match self {
            Entity::File(f) => f.state.read().attributes.len(),
            Entity::Directory(_) => 0,
        }
    }

    /// The thumbnail bytes, if the entity has a thumbnail attribute.
    pub fn thumbnail(&self) -> Option<Vec<u8>> {
        self.get_attribute(THUMBNAIL_ATTRIBUTE)
            .and_then(|attr| attr.value().as_image().map(<[u8]>::to_vec))
    }

    /// Overwrites this entity's state with a copy of `other`'s.
    ///
    /// Used to revert a shared instance to a snapshot in place, so every
    /// holder of the `Arc` observes the restored state.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if one is a file and the other a directory.
    pub fn restore_from(&self, other: &Entity) -> Result<()> {
        match (self, other) {
            (Entity::File(target), Entity::File(source)) => {
                let snapshot = source.state.read().clone();
                *target.state.write() = snapshot;
                Ok(())
            }
            (Entity::Directory(target), Entity::Directory(source)) => {
                let path = source.path.read().clone();
                *target.path.write() = path;
                Ok(())
            }
            _ => Err(Error::InvalidArgument(format!(
                "cannot restore '{}' from an entity of a different kind",
                self.path()
            ))),
        }
    }

    /// Listing order: directories before files, then by path.
    pub fn compare_for_listing(&self, other: &Entity) -> Ordering {
        match (self.is_directory(), other.is_directory()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => self.path().cmp(&other.path()),
        }
    }
}

/// Two entities are equal when they have the same kind, path and attributes.
/// Access and write times are bookkeeping and do not take part.
impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.is_file() == other.is_file()
            && self.path() == other.path()
            && self.attributes() == other.attributes()
    }
}
