//! Module/DWARF index (C10): locates the loaded shared object or executable
//! containing a PC and answers `die_at`/`line_at`/`symbol_at` against it,
//! built on `object` for section access and `gimli` for DWARF parsing.
//!
//! CFI stays out of `gimli`'s hands on purpose — see the module doc comment
//! on [`crate::dwarf::cfi`] — so this module only hands `eh_cfi`/`debug_cfi`
//! callers the raw section bytes and the load bias they need to feed that
//! hand-rolled parser.

use std::collections::BTreeMap;
use std::ffi::{c_int, c_void, CStr};
use std::path::PathBuf;

use gimli::{EndianSlice, LittleEndian};
use object::{Object, ObjectSection, ObjectSymbol};
use tracing::instrument;

use crate::error::DependencyError;

type R<'a> = EndianSlice<'a, LittleEndian>;

/// Everything this crate needs from one loaded module, parsed lazily and
/// cached for the lifetime of the owning [`crate::handler::Handler`].
pub struct Module {
    pub path: PathBuf,
    pub bias: u64,
    pub low: u64,
    pub high: u64,
    /// Kept alive for the `'static`-lifetime borrows below; never accessed
    /// directly once `sections`/`dwarf` are populated.
    _mmap: memmap2::Mmap,
    object_sections: ModuleSections,
    dwarf: once_cell::sync::OnceCell<gimli::Dwarf<R<'static>>>,
}

struct ModuleSections {
    eh_frame: Option<&'static [u8]>,
    eh_frame_addr: u64,
    eh_frame_hdr: Option<&'static [u8]>,
    debug_frame: Option<&'static [u8]>,
    debug_frame_addr: u64,
    text_addr: u64,
    symbols: BTreeMap<u64, (u64, String)>,
}

impl Module {
    /// Loads and parses the ELF at `path`, given the runtime load bias and
    /// address range `dl_iterate_phdr` reported for it.
    #[instrument(skip_all, fields(path = %path.display()))]
    fn load(path: PathBuf, bias: u64, low: u64, high: u64) -> Result<Module, DependencyError> {
        let file = std::fs::File::open(&path).map_err(|_| DependencyError::NoModule(low))?;
        // SAFETY: the file backing this mapping is not modified for the
        // lifetime of the handler; post-mortem introspection of the crashed
        // process's own binaries never writes to them.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|_| DependencyError::NoModule(low))?;

        // SAFETY: `mmap`'s backing pages stay resident at a fixed address for
        // as long as the mapping lives; `Module` never drops `_mmap` before
        // these borrows, and moving `Module` itself does not move the
        // mapped pages (only the handle that points at them).
        let data: &'static [u8] = unsafe { std::slice::from_raw_parts(mmap.as_ptr(), mmap.len()) };

        let obj = object::File::parse(data).map_err(|_| DependencyError::NoModule(low))?;

        let eh_frame_section = obj.section_by_name(".eh_frame");
        let eh_frame = eh_frame_section.as_ref().and_then(|s| s.data().ok());
        let eh_frame_addr = eh_frame_section.as_ref().map(|s| s.address()).unwrap_or(0);
        let eh_frame_hdr = obj.section_by_name(".eh_frame_hdr").and_then(|s| s.data().ok());
        let debug_frame_section = obj.section_by_name(".debug_frame");
        let debug_frame = debug_frame_section.as_ref().and_then(|s| s.data().ok());
        let debug_frame_addr = debug_frame_section.as_ref().map(|s| s.address()).unwrap_or(0);
        let text_addr = obj.section_by_name(".text").map(|s| s.address()).unwrap_or(0);

        let mut symbols = BTreeMap::new();
        for sym in obj.symbols().chain(obj.dynamic_symbols()) {
            if sym.is_definition() && sym.size() > 0 {
                if let Ok(name) = sym.name() {
                    symbols.insert(sym.address(), (sym.size(), name.to_string()));
                }
            }
        }

        Ok(Module {
            path,
            bias,
            low,
            high,
            _mmap: mmap,
            object_sections: ModuleSections {
                eh_frame,
                eh_frame_addr,
                eh_frame_hdr,
                debug_frame,
                debug_frame_addr,
                text_addr,
                symbols,
            },
            dwarf: once_cell::sync::OnceCell::new(),
        })
    }

    fn dwarf(&self) -> Result<&gimli::Dwarf<R<'static>>, DependencyError> {
        self.dwarf.get_or_try_init(|| {
            // SAFETY: see `load` — the mapping outlives every reference handed
            // out of this module, including these section slices.
            let obj = object::File::parse(unsafe {
                std::slice::from_raw_parts(self._mmap.as_ptr(), self._mmap.len())
            })
            .map_err(|_| DependencyError::NoModule(self.low))?;
            gimli::Dwarf::load(|id| -> Result<R<'static>, DependencyError> {
                let data = obj
                    .section_by_name(id.name())
                    .and_then(|s| s.uncompressed_data().ok())
                    .map(|cow| match cow {
                        std::borrow::Cow::Borrowed(b) => b,
                        std::borrow::Cow::Owned(v) => Box::leak(v.into_boxed_slice()),
                    })
                    .unwrap_or(&[]);
                Ok(EndianSlice::new(data, LittleEndian))
            })
            .map_err(|_: DependencyError| DependencyError::NoDie(self.low))
        })
    }

    /// Returns `(low_pc, high_pc, name)` for the `DW_TAG_subprogram` DIE
    /// covering the bias-adjusted `pc`, plus its parsed parameters/call sites.
    pub fn die_at(&self, pc: u64) -> Result<crate::dwarf::die::Subprogram, DependencyError> {
        let dwarf = self.dwarf()?;
        let target = pc.wrapping_sub(self.bias);
        let mut units = dwarf.units();
        while let Ok(Some(header)) = units.next() {
            let Ok(unit) = dwarf.unit(header) else { continue };
            let Ok(mut entries) = unit.entries() else { continue };
            while let Ok(Some((_, entry))) = entries.next_dfs() {
                if entry.tag() != gimli::DW_TAG_subprogram {
                    continue;
                }
                let offset = entry.offset();
                if let Ok(sub) = crate::dwarf::die::walk_subprogram(dwarf, &unit, offset) {
                    if sub.high_pc > sub.low_pc && target >= sub.low_pc && target < sub.high_pc {
                        return Ok(sub);
                    }
                }
            }
        }
        Err(DependencyError::NoDie(pc))
    }

    /// Resolves `(file, line)` for the bias-adjusted `pc` via the owning
    /// compilation unit's line number program.
    pub fn line_at(&self, pc: u64) -> Result<(String, u64), DependencyError> {
        let dwarf = self.dwarf()?;
        let target = pc.wrapping_sub(self.bias);
        let mut units = dwarf.units();
        while let Ok(Some(header)) = units.next() {
            let Ok(unit) = dwarf.unit(header) else { continue };
            let Some(program) = unit.line_program.clone() else { continue };
            let mut best: Option<(u64, String, u64)> = None;
            let mut rows = program.rows();
            while let Ok(Some((header, row))) = rows.next_row() {
                let addr = row.address();
                if addr > target {
                    continue;
                }
                if best.as_ref().map(|(a, _, _)| addr > *a).unwrap_or(true) {
                    let file = row
                        .file(header)
                        .and_then(|f| dwarf.attr_string(&unit, f.path_name()).ok())
                        .and_then(|r| r.to_string_lossy().ok().map(|c| c.into_owned()))
                        .unwrap_or_else(|| "<unknown>".to_string());
                    let line = row.line().map(|l| l.get()).unwrap_or(0);
                    best = Some((addr, file, line));
                }
            }
            if let Some((_, file, line)) = best {
                return Ok((file, line));
            }
        }
        Err(DependencyError::NoLine(pc))
    }

    /// Returns the mangled symbol name covering the bias-adjusted `pc`, from
    /// the ELF symbol table (used as a fallback source of a function name
    /// when DWARF has no DIE for it).
    pub fn symbol_at(&self, pc: u64) -> Option<&str> {
        let target = pc.wrapping_sub(self.bias);
        self.object_sections
            .symbols
            .range(..=target)
            .next_back()
            .filter(|(addr, (size, _))| target < *addr + *size)
            .map(|(_, (_, name))| name.as_str())
    }

    pub fn eh_frame(&self) -> Option<&[u8]> {
        self.object_sections.eh_frame
    }

    pub fn eh_frame_hdr(&self) -> Option<&[u8]> {
        self.object_sections.eh_frame_hdr
    }

    pub fn debug_frame(&self) -> Option<&[u8]> {
        self.object_sections.debug_frame
    }

    pub fn text_addr(&self) -> u64 {
        self.object_sections.text_addr
    }

    /// Linked (bias-less) load address of `.eh_frame`, needed to resolve
    /// `pcrel`-encoded pointers while scanning for a CIE/FDE by PC.
    pub fn eh_frame_addr(&self) -> u64 {
        self.object_sections.eh_frame_addr
    }

    pub fn debug_frame_addr(&self) -> u64 {
        self.object_sections.debug_frame_addr
    }
}

/// Index over every module mapped into the current process, populated
/// lazily as `module_of` is asked about addresses it hasn't seen.
#[derive(Default)]
pub struct ModuleIndex {
    modules: Vec<Module>,
}

impl ModuleIndex {
    pub fn new() -> Self {
        ModuleIndex { modules: Vec::new() }
    }

    /// Locates (loading on first request) the module containing `pc`, via
    /// `dl_iterate_phdr` — the same "ask the dynamic linker" approach the
    /// teacher's exploratory `_dl_find_object` binding used, expressed
    /// through the portable libc callback instead of the GNU-only symbol.
    #[instrument(skip(self))]
    pub fn module_of(&mut self, pc: u64) -> Result<&Module, DependencyError> {
        if let Some(idx) = self.modules.iter().position(|m| pc >= m.low && pc < m.high) {
            return Ok(&self.modules[idx]);
        }
        let found = locate_via_dl_iterate_phdr(pc).ok_or(DependencyError::NoModule(pc))?;
        let module = Module::load(found.path, found.bias, found.low, found.high)?;
        self.modules.push(module);
        Ok(self.modules.last().unwrap())
    }

    pub fn bias_of(&mut self, pc: u64) -> Result<u64, DependencyError> {
        self.module_of(pc).map(|m| m.bias)
    }
}

struct FoundModule {
    path: PathBuf,
    bias: u64,
    low: u64,
    high: u64,
}

extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    // SAFETY: `dl_iterate_phdr` guarantees `info` is valid for the duration
    // of this call, and `data` is the `*mut PhdrSearch` passed in below.
    unsafe {
        let search = &mut *(data as *mut PhdrSearch);
        let info = &*info;
        let base = info.dlpi_addr as u64;
        let mut low = u64::MAX;
        let mut high = 0u64;
        for i in 0..info.dlpi_phnum {
            let phdr = &*info.dlpi_phdr.add(i as usize);
            if phdr.p_type != libc::PT_LOAD {
                continue;
            }
            let start = base + phdr.p_vaddr;
            let end = start + phdr.p_memsz;
            low = low.min(start);
            high = high.max(end);
        }
        if low <= search.pc && search.pc < high {
            let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
                std::env::current_exe().unwrap_or_default()
            } else {
                PathBuf::from(CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned())
            };
            search.found = Some(FoundModule { path, bias: base, low, high });
            return 1;
        }
        0
    }
}

struct PhdrSearch {
    pc: u64,
    found: Option<FoundModule>,
}

fn locate_via_dl_iterate_phdr(pc: u64) -> Option<FoundModule> {
    let mut search = PhdrSearch { pc, found: None };
    // SAFETY: `phdr_callback` only touches the `info` it's handed and the
    // `PhdrSearch` behind `data`, both valid for the call's duration.
    unsafe {
        libc::dl_iterate_phdr(Some(phdr_callback), &mut search as *mut _ as *mut c_void);
    }
    search.found
}
