//! Image and instruction registry.
//!
//! Maps `(image, offset)` pairs to stable instruction ids that label
//! scheduling points, and lazily decorates instructions with source
//! locations. The registry persists to a compact little-endian file so ids
//! stay stable across runs of a campaign.
//!
//! ## File layout
//!
//! ```text
//! "SCTI"  version:u32  n_images:u32
//!   { id:u64  name_len:u32  name:[u8] } * n_images
//! n_insts:u32
//!   { id:u64  image_id:u64  offset:u64  has_debug:u8
//!     [ file_len:u32 file:[u8] line:u32 column:u32 ] } * n_insts
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, info};

use crate::error::{Result, SchedError};
use crate::symbolizer::{Addr2Line, Symbolizer};
use crate::types::{Address, ImageId, InstId};

const STATIC_INFO_MAGIC: &[u8; 4] = b"SCTI";
const STATIC_INFO_VERSION: u32 = 1;

/// Library name prefixes treated as runtime support.
const COMMON_LIBS: &[&str] = &[
    "libc", "libpthread", "ld-", "libgcc_s", "libm", "libnsl", "librt", "libdl", "libz",
    "libcrypt", "libdb", "libexpat", "libbz2",
];

/// Path suffix after the last `/`.
pub fn short_name(name: &str) -> &str {
    match name.rfind('/') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}

/// Write `buf` to a sibling temporary file and rename it over `path`.
/// The temporary file is removed when any step fails.
pub(crate) fn replace_file(path: &Path, buf: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let written = std::fs::File::create(&tmp_path).and_then(|mut f| {
        f.write_all(buf)?;
        f.sync_all()
    });
    let result = written.and_then(|_| std::fs::rename(&tmp_path, path));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

pub fn is_common_lib(name: &str) -> bool {
    let short = short_name(name);
    COMMON_LIBS.iter().any(|p| short.starts_with(p))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl DebugInfo {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        DebugInfo {
            file: file.into(),
            line,
            column,
        }
    }

    /// Placeholder for locations the resolver could not find.
    pub fn unknown() -> Self {
        Self::new("??", 0, 0)
    }
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// A loaded binary or shared library.
pub struct Image {
    id: ImageId,
    name: String,
    insts: RwLock<BTreeMap<Address, Arc<Inst>>>,
}

impl Image {
    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> &str {
        short_name(&self.name)
    }

    pub fn is_common_lib(&self) -> bool {
        is_common_lib(&self.name)
    }

    pub fn is_libc(&self) -> bool {
        self.short_name().starts_with("libc.") || self.short_name().starts_with("libc-")
    }

    pub fn is_pthread(&self) -> bool {
        self.short_name().starts_with("libpthread")
    }

    /// The instruction registered at `offset`.
    pub fn find(&self, offset: Address) -> Option<Arc<Inst>> {
        self.insts.read().unwrap().get(&offset).cloned()
    }

    pub fn num_insts(&self) -> usize {
        self.insts.read().unwrap().len()
    }

    /// Instructions in offset order.
    pub fn insts(&self) -> Vec<Arc<Inst>> {
        self.insts.read().unwrap().values().cloned().collect()
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("insts", &self.num_insts())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Inst
// ---------------------------------------------------------------------------

/// A program location, unique per `(image, offset)`.
pub struct Inst {
    id: InstId,
    image: Weak<Image>,
    image_id: ImageId,
    offset: Address,
    /// Last runtime address observed for this instruction, 0 if none.
    pc: AtomicU64,
    debug: RwLock<Option<DebugInfo>>,
}

impl Inst {
    pub fn id(&self) -> InstId {
        self.id
    }

    pub fn image_id(&self) -> ImageId {
        self.image_id
    }

    pub fn image(&self) -> Option<Arc<Image>> {
        self.image.upgrade()
    }

    pub fn offset(&self) -> Address {
        self.offset
    }

    pub fn record_pc(&self, pc: Address) {
        self.pc.store(pc, Ordering::Relaxed);
    }

    pub fn pc(&self) -> Option<Address> {
        match self.pc.load(Ordering::Relaxed) {
            0 => None,
            pc => Some(pc),
        }
    }

    pub fn set_debug_info(&self, file: impl Into<String>, line: u32, column: u32) {
        *self.debug.write().unwrap() = Some(DebugInfo::new(file, line, column));
    }

    pub fn debug_info(&self) -> Option<DebugInfo> {
        self.debug.read().unwrap().clone()
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let image = self.image();
        let image = image.as_deref().map_or("?", |i| i.name());
        write!(f, "{:x} {} {:#x}", self.id.0, image, self.offset)?;
        match self.debug_info() {
            Some(d) => write!(f, " ({d})"),
            None => write!(f, " (??:0)"),
        }
    }
}

impl fmt::Debug for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inst({self})")
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    images: BTreeMap<ImageId, Arc<Image>>,
    insts: BTreeMap<InstId, Arc<Inst>>,
    next_image: u64,
    next_inst: u64,
}

/// Process-wide registry of images and instructions.
pub struct StaticInfo {
    tables: Mutex<Tables>,
    symbolizer: Box<dyn Symbolizer>,
}

impl Default for StaticInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticInfo {
    /// A registry resolving through `addr2line` against this process.
    pub fn new() -> Self {
        Self::with_symbolizer(Box::new(Addr2Line::for_self()))
    }

    pub fn with_symbolizer(symbolizer: Box<dyn Symbolizer>) -> Self {
        StaticInfo {
            tables: Mutex::new(Tables::default()),
            symbolizer,
        }
    }

    pub fn create_image(&self, name: &str) -> Arc<Image> {
        let mut t = self.tables.lock().unwrap();
        let id = ImageId(t.next_image);
        t.next_image += 1;
        let image = Arc::new(Image {
            id,
            name: name.to_string(),
            insts: RwLock::new(BTreeMap::new()),
        });
        t.images.insert(id, image.clone());
        debug!(image = id.0, name, "image registered");
        image
    }

    /// Register the instruction at `offset`, or return the one already
    /// registered there.
    pub fn create_inst(&self, image: &Arc<Image>, offset: Address) -> Arc<Inst> {
        let mut t = self.tables.lock().unwrap();
        if let Some(inst) = image.find(offset) {
            return inst;
        }
        let id = InstId(t.next_inst);
        t.next_inst += 1;
        let inst = Arc::new(Inst {
            id,
            image: Arc::downgrade(image),
            image_id: image.id,
            offset,
            pc: AtomicU64::new(0),
            debug: RwLock::new(None),
        });
        image.insts.write().unwrap().insert(offset, inst.clone());
        t.insts.insert(id, inst.clone());
        inst
    }

    /// Find an image by file name, comparing only the part after the last
    /// `/` on both sides.
    pub fn find_image_by_name(&self, name: &str) -> Option<Arc<Image>> {
        let short = short_name(name);
        let t = self.tables.lock().unwrap();
        t.images
            .values()
            .find(|i| i.short_name() == short)
            .cloned()
    }

    pub fn find_image(&self, id: ImageId) -> Option<Arc<Image>> {
        self.tables.lock().unwrap().images.get(&id).cloned()
    }

    pub fn find_inst(&self, id: InstId) -> Option<Arc<Inst>> {
        self.tables.lock().unwrap().insts.get(&id).cloned()
    }

    pub fn images(&self) -> Vec<Arc<Image>> {
        self.tables.lock().unwrap().images.values().cloned().collect()
    }

    pub fn num_insts(&self) -> usize {
        self.tables.lock().unwrap().insts.len()
    }

    /// `file:line` of `inst`, resolving it through the symbolizer on first
    /// use. A failed lookup is remembered as `??:0`; an instruction with
    /// no known PC is reported as `??:0` without remembering.
    pub fn debug_info_string(&self, inst: &Inst) -> String {
        if let Some(d) = inst.debug_info() {
            return d.to_string();
        }
        let Some(pc) = inst.pc() else {
            return DebugInfo::unknown().to_string();
        };
        let d = self.symbolizer.resolve(pc).unwrap_or_else(DebugInfo::unknown);
        let s = d.to_string();
        *inst.debug.write().unwrap() = Some(d);
        s
    }

    /// Label for a scheduling point at instruction `id`.
    pub fn label(&self, id: InstId) -> Option<String> {
        let inst = self.find_inst(id)?;
        Some(self.debug_info_string(&inst))
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn encode(&self) -> Vec<u8> {
        let t = self.tables.lock().unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(STATIC_INFO_MAGIC);
        buf.extend_from_slice(&STATIC_INFO_VERSION.to_le_bytes());

        buf.extend_from_slice(&(t.images.len() as u32).to_le_bytes());
        for image in t.images.values() {
            buf.extend_from_slice(&image.id.0.to_le_bytes());
            put_str(&mut buf, &image.name);
        }

        buf.extend_from_slice(&(t.insts.len() as u32).to_le_bytes());
        for inst in t.insts.values() {
            buf.extend_from_slice(&inst.id.0.to_le_bytes());
            buf.extend_from_slice(&inst.image_id.0.to_le_bytes());
            buf.extend_from_slice(&inst.offset.to_le_bytes());
            match inst.debug_info() {
                Some(d) => {
                    buf.push(1);
                    put_str(&mut buf, &d.file);
                    buf.extend_from_slice(&d.line.to_le_bytes());
                    buf.extend_from_slice(&d.column.to_le_bytes());
                }
                None => buf.push(0),
            }
        }
        buf
    }

    /// Write the whole registry to `path` through a temporary file that is
    /// renamed into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let io_err = |source: std::io::Error| SchedError::Persistence {
            path: path.to_path_buf(),
            source,
        };
        let buf = self.encode();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        replace_file(path, &buf).map_err(io_err)?;
        info!(path = %path.display(), bytes = buf.len(), "static info saved");
        Ok(())
    }

    /// Replace the registry contents with those stored at `path`.
    ///
    /// The file is fully parsed before anything is replaced, so a corrupt
    /// file leaves the registry untouched.
    pub fn load(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path).map_err(|source| SchedError::Persistence {
            path: path.to_path_buf(),
            source,
        })?;
        let mut r = Reader {
            data: &data,
            pos: 0,
            path,
        };
        if r.bytes(4)? != STATIC_INFO_MAGIC {
            return Err(r.corrupt("bad magic"));
        }
        let version = r.u32()?;
        if version != STATIC_INFO_VERSION {
            return Err(r.corrupt(&format!("unknown version {version}")));
        }

        let mut tables = Tables::default();
        for _ in 0..r.u32()? {
            let id = ImageId(r.u64()?);
            let name = r.string()?;
            tables.next_image = tables.next_image.max(id.0 + 1);
            let image = Arc::new(Image {
                id,
                name,
                insts: RwLock::new(BTreeMap::new()),
            });
            if tables.images.insert(id, image).is_some() {
                return Err(r.corrupt(&format!("duplicate image id {}", id.0)));
            }
        }
        for _ in 0..r.u32()? {
            let id = InstId(r.u64()?);
            let image_id = ImageId(r.u64()?);
            let offset = r.u64()?;
            let debug = match r.u8()? {
                0 => None,
                1 => {
                    let file = r.string()?;
                    let line = r.u32()?;
                    let column = r.u32()?;
                    Some(DebugInfo::new(file, line, column))
                }
                other => return Err(r.corrupt(&format!("bad debug flag {other}"))),
            };
            let Some(image) = tables.images.get(&image_id) else {
                return Err(r.corrupt(&format!(
                    "instruction {} refers to missing image {}",
                    id.0, image_id.0
                )));
            };
            let inst = Arc::new(Inst {
                id,
                image: Arc::downgrade(image),
                image_id,
                offset,
                pc: AtomicU64::new(0),
                debug: RwLock::new(debug),
            });
            image.insts.write().unwrap().insert(offset, inst.clone());
            if tables.insts.insert(id, inst).is_some() {
                return Err(r.corrupt(&format!("duplicate instruction id {}", id.0)));
            }
            tables.next_inst = tables.next_inst.max(id.0 + 1);
        }
        if r.pos != data.len() {
            return Err(r.corrupt("trailing bytes"));
        }

        info!(
            path = %path.display(),
            images = tables.images.len(),
            insts = tables.insts.len(),
            "static info loaded"
        );
        *self.tables.lock().unwrap() = tables;
        Ok(())
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Reader<'a> {
    fn corrupt(&self, reason: &str) -> SchedError {
        SchedError::Format {
            path: self.path.to_path_buf(),
            reason: format!("{reason} at byte {}", self.pos),
        }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| self.corrupt("truncated"))?;
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.corrupt("invalid utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Symbolizer that answers every pc with a fixed line and counts calls.
    struct Fixed {
        calls: Arc<AtomicUsize>,
        answer: Option<DebugInfo>,
    }

    impl Symbolizer for Fixed {
        fn resolve(&self, _pc: Address) -> Option<DebugInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn fixed(answer: Option<DebugInfo>) -> (StaticInfo, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let info = StaticInfo::with_symbolizer(Box::new(Fixed {
            calls: calls.clone(),
            answer,
        }));
        (info, calls)
    }

    #[test]
    fn test_common_lib_predicate() {
        assert!(is_common_lib("/lib/x86_64-linux-gnu/libpthread.so.0"));
        assert!(is_common_lib("/lib64/ld-linux-x86-64.so.2"));
        assert!(is_common_lib("libz.so.1"));
        assert!(!is_common_lib("/usr/bin/myapp"));
        assert!(!is_common_lib("/opt/libfoo/bin/server"));
    }

    #[test]
    fn test_image_predicates() {
        let info = StaticInfo::new();
        let libc = info.create_image("/lib/x86_64-linux-gnu/libc.so.6");
        let pthread = info.create_image("/lib/x86_64-linux-gnu/libpthread.so.0");
        let app = info.create_image("/usr/bin/myapp");
        assert!(libc.is_libc() && !libc.is_pthread());
        assert!(pthread.is_pthread() && !pthread.is_libc());
        assert!(!app.is_common_lib());
        assert_eq!(app.short_name(), "myapp");
    }

    #[test]
    fn test_find_image_by_short_name() {
        let info = StaticInfo::new();
        let img = info.create_image("/home/u/build/a.out");
        assert_eq!(info.find_image_by_name("a.out").unwrap().id(), img.id());
        assert_eq!(
            info.find_image_by_name("/elsewhere/a.out").unwrap().id(),
            img.id()
        );
        assert!(info.find_image_by_name("b.out").is_none());
        assert_eq!(info.find_image(img.id()).unwrap().name(), "/home/u/build/a.out");
    }

    #[test]
    fn test_create_inst_is_idempotent_per_offset() {
        let info = StaticInfo::new();
        let img = info.create_image("a.out");
        let a = info.create_inst(&img, 0x10);
        let b = info.create_inst(&img, 0x10);
        let c = info.create_inst(&img, 0x20);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(info.num_insts(), 2);
        assert_eq!(img.find(0x20).unwrap().id(), c.id());
        assert_eq!(info.find_inst(c.id()).unwrap().offset(), 0x20);
        assert_eq!(c.image().unwrap().id(), img.id());
    }

    #[test]
    fn test_lazy_resolution_is_memoised() {
        let (info, calls) = fixed(Some(DebugInfo::new("main.c", 12, 0)));
        let img = info.create_image("a.out");
        let inst = info.create_inst(&img, 0x40);

        // No pc yet: nothing to resolve, nothing remembered.
        assert_eq!(info.debug_info_string(&inst), "??:0");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        inst.record_pc(0x5555_0040);
        assert_eq!(info.debug_info_string(&inst), "main.c:12");
        assert_eq!(info.debug_info_string(&inst), "main.c:12");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(info.label(inst.id()).unwrap(), "main.c:12");
    }

    #[test]
    fn test_resolver_miss_becomes_unknown() {
        let (info, calls) = fixed(None);
        let img = info.create_image("a.out");
        let inst = info.create_inst(&img, 0x40);
        inst.record_pc(0x1234);
        assert_eq!(info.debug_info_string(&inst), "??:0");
        assert_eq!(info.debug_info_string(&inst), "??:0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_preset_debug_info_skips_resolver() {
        let (info, calls) = fixed(None);
        let img = info.create_image("a.out");
        let inst = info.create_inst(&img, 0x8);
        inst.set_debug_info("prog.rs", 3, 9);
        inst.record_pc(0x99);
        assert_eq!(info.debug_info_string(&inst), "prog.rs:3");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(inst.to_string(), "0 a.out 0x8 (prog.rs:3)");

        let lib = info.create_image("/lib/libc.so.6");
        let other = info.create_inst(&lib, 0x20);
        assert_eq!(other.to_string(), "1 /lib/libc.so.6 0x20 (??:0)");
    }

    #[test]
    fn test_save_load_preserves_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static.bin");

        let info = StaticInfo::new();
        let img = info.create_image("/usr/bin/a.out");
        let insts: Vec<_> = [0x10, 0x20, 0x30]
            .into_iter()
            .map(|off| info.create_inst(&img, off))
            .collect();
        insts[1].set_debug_info("a.c", 20, 4);
        info.save(&path).unwrap();

        let restored = StaticInfo::new();
        restored.load(&path).unwrap();
        let found = restored
            .find_image_by_name("a.out")
            .unwrap()
            .find(0x20)
            .unwrap();
        assert_eq!(found.id(), insts[1].id());
        assert_eq!(found.debug_info(), Some(DebugInfo::new("a.c", 20, 4)));

        // Allocators continue after the restored maxima.
        let other = restored.create_image("libx.so");
        assert_eq!(other.id(), ImageId(img.id().0 + 1));
        let next = restored.create_inst(&other, 0);
        assert_eq!(next.id(), InstId(3));
    }

    #[test]
    fn test_save_load_save_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("one.bin");
        let second = dir.path().join("two.bin");

        let info = StaticInfo::new();
        for name in ["a.out", "/lib/libc.so.6"] {
            let img = info.create_image(name);
            for off in [0x100, 0x80, 0x200] {
                let inst = info.create_inst(&img, off);
                if off == 0x80 {
                    inst.set_debug_info(format!("{name}.c"), off as u32, 1);
                }
            }
        }
        info.save(&first).unwrap();

        let restored = StaticInfo::new();
        restored.load(&first).unwrap();
        restored.save(&second).unwrap();
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn test_failed_save_removes_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in the way makes the final rename fail.
        let path = dir.path().join("static.bin");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();

        let info = StaticInfo::new();
        let img = info.create_image("a.out");
        info.create_inst(&img, 0x10);
        let err = info.save(&path).unwrap_err();
        assert!(matches!(err, SchedError::Persistence { .. }));
        assert!(!path.with_extension("tmp").exists());
        assert!(path.is_dir());
    }

    #[test]
    fn test_corrupt_file_leaves_registry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static.bin");

        let info = StaticInfo::new();
        let img = info.create_image("a.out");
        info.create_inst(&img, 0x10);
        info.save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, &bytes).unwrap();

        let other = StaticInfo::new();
        other.create_image("keep.me");
        let err = other.load(&path).unwrap_err();
        assert!(matches!(err, SchedError::Format { .. }));
        assert!(other.find_image_by_name("keep.me").is_some());

        std::fs::write(&path, b"NOPE\x01\0\0\0").unwrap();
        assert!(matches!(
            other.load(&path).unwrap_err(),
            SchedError::Format { .. }
        ));

        let missing = dir.path().join("missing.bin");
        assert!(matches!(
            other.load(&missing).unwrap_err(),
            SchedError::Persistence { .. }
        ));
    }
}
