//! ELF32 module and symbol resolution over remote memory.
//!
//! Everything here reads the traced process's own copy of its ELF headers,
//! dynamic sections and the dynamic linker's link map. Nothing is mapped
//! locally, so stripped binaries work as long as their dynamic symbol table
//! survives.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::memory::{RemoteMemory, read_cstring};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: u32 = 0;
const DT_HASH: u32 = 4;
const DT_STRTAB: u32 = 5;
const DT_SYMTAB: u32 = 6;
const DT_DEBUG: u32 = 21;
const DT_GNU_HASH: u32 = 0x6fff_fef5;

const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;
const STT_FUNC: u8 = 2;
const SHN_UNDEF: u16 = 0;

const SYM_SIZE: u32 = 16;
const PHDR_SIZE: u32 = 32;
const DYN_SIZE: u32 = 8;

/// Walk limits against corrupt or cyclic structures.
const MAX_DYNAMIC_ENTRIES: u32 = 512;
const MAX_LINK_MAP_ENTRIES: usize = 256;
const MAX_PHDRS: u16 = 64;
/// Bound on a `DT_GNU_HASH` chain walk.
const MAX_HASH_CHAIN: u32 = 1 << 16;

/// One loaded ELF image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Address the ELF header is mapped at.
    pub base: u32,
    /// Value added to symbol and dynamic-section addresses.
    pub bias: u32,
    pub size: u32,
    pub name: String,
    pub is_exe: bool,
    pub is_ld: bool,
    pub is_libc: bool,
    pub symtab: u32,
    pub strtab: u32,
    pub hash: Option<u32>,
    pub gnu_hash: Option<u32>,
}

impl Module {
    pub fn contains(&self, addr: u32) -> bool {
        let addr = addr & !1;
        addr >= self.base && addr - self.base < self.size
    }

    pub fn has_symbols(&self) -> bool {
        self.symtab != 0 && self.strtab != 0 && (self.hash.is_some() || self.gnu_hash.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Global,
    Weak,
}

/// A resolved dynamic symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Runtime address; bit 0 set for Thumb functions.
    pub addr: u32,
    pub size: u32,
    pub binding: Binding,
    pub is_func: bool,
}

/// The dynamic linker's `r_debug` as seen through `DT_DEBUG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugLink {
    /// First `link_map` entry.
    pub map: u32,
    /// Load address of the dynamic linker.
    pub ld_base: u32,
}

struct Image {
    e_type: u16,
    entry: u32,
    bias: u32,
    size: u32,
    dynamic: Option<u32>,
}

#[derive(Default)]
struct DynamicInfo {
    symtab: u32,
    strtab: u32,
    hash: Option<u32>,
    gnu_hash: Option<u32>,
    debug: u32,
}

fn invalid<T>(_: Error) -> Result<T> {
    Err(Error::InvalidModule)
}

/// Header and program-header facts of the image mapped at `base`.
fn read_image(mem: &dyn RemoteMemory, base: u32) -> Result<Image> {
    let mut ident = [0u8; 5];
    mem.read(base, &mut ident).or_else(invalid)?;
    if ident[..4] != ELF_MAGIC || ident[4] != ELFCLASS32 {
        return Err(Error::InvalidModule);
    }

    let e_type = mem.read_u16(base.wrapping_add(16)).or_else(invalid)?;
    let entry = mem.read_u32(base.wrapping_add(24)).or_else(invalid)?;
    let phoff = mem.read_u32(base.wrapping_add(28)).or_else(invalid)?;
    let phentsize = mem.read_u16(base.wrapping_add(42)).or_else(invalid)? as u32;
    let phnum = mem.read_u16(base.wrapping_add(44)).or_else(invalid)?;

    let bias = match e_type {
        ET_EXEC => 0,
        ET_DYN => base,
        _ => return Err(Error::InvalidModule),
    };
    if phnum > MAX_PHDRS || (phnum > 0 && phentsize < PHDR_SIZE) {
        return Err(Error::InvalidModule);
    }

    let mut end = base;
    let mut dynamic = None;
    for i in 0..phnum as u32 {
        let ph = base.wrapping_add(phoff).wrapping_add(i * phentsize);
        let p_type = mem.read_u32(ph).or_else(invalid)?;
        let p_vaddr = mem.read_u32(ph.wrapping_add(8)).or_else(invalid)?;
        let p_memsz = mem.read_u32(ph.wrapping_add(20)).or_else(invalid)?;
        match p_type {
            PT_LOAD => end = end.max(bias.wrapping_add(p_vaddr).wrapping_add(p_memsz)),
            PT_DYNAMIC => dynamic = Some(bias.wrapping_add(p_vaddr)),
            _ => {}
        }
    }

    Ok(Image {
        e_type,
        entry,
        bias,
        size: end.wrapping_sub(base),
        dynamic,
    })
}

/// Dynamic-section pointers are absolute once relocated, bias-relative before.
fn rebase(ptr: u32, bias: u32) -> u32 {
    if ptr < bias { bias.wrapping_add(ptr) } else { ptr }
}

fn read_dynamic(mem: &dyn RemoteMemory, dynamic: u32, bias: u32) -> Result<DynamicInfo> {
    let mut info = DynamicInfo::default();
    for i in 0..MAX_DYNAMIC_ENTRIES {
        let entry = dynamic.wrapping_add(i * DYN_SIZE);
        let tag = mem.read_u32(entry).or_else(invalid)?;
        let val = mem.read_u32(entry.wrapping_add(4)).or_else(invalid)?;
        match tag {
            DT_NULL => return Ok(info),
            DT_HASH => info.hash = Some(rebase(val, bias)),
            DT_STRTAB => info.strtab = rebase(val, bias),
            DT_SYMTAB => info.symtab = rebase(val, bias),
            DT_GNU_HASH => info.gnu_hash = Some(rebase(val, bias)),
            DT_DEBUG => info.debug = val,
            _ => {}
        }
    }
    Err(Error::InvalidModule)
}

/// Entry point of the image at `base`, mode-tagged like any code address.
pub fn executable_entry(mem: &dyn RemoteMemory, base: u32) -> Result<u32> {
    let image = read_image(mem, base)?;
    Ok(match image.e_type {
        ET_DYN => base.wrapping_add(image.entry),
        _ => image.entry,
    })
}

/// Find the dynamic linker's `r_debug` through the executable's `DT_DEBUG`.
///
/// `None` until the dynamic linker has filled it in, or for static images.
pub fn locate_debug_link(mem: &dyn RemoteMemory, executable_base: u32) -> Option<DebugLink> {
    let image = read_image(mem, executable_base).ok()?;
    let info = read_dynamic(mem, image.dynamic?, image.bias).ok()?;
    if info.debug == 0 {
        return None;
    }
    let map = mem.read_u32(info.debug.wrapping_add(4)).ok()?;
    let ld_base = mem.read_u32(info.debug.wrapping_add(16)).ok()?;
    (map != 0).then_some(DebugLink { map, ld_base })
}

fn fill_module(mem: &dyn RemoteMemory, base: u32, name: String, dynamic: Option<u32>) -> Result<Module> {
    let image = read_image(mem, base)?;
    let dynamic = dynamic.or(image.dynamic);
    let info = match dynamic {
        Some(d) => read_dynamic(mem, d, image.bias)?,
        None => DynamicInfo::default(),
    };
    Ok(Module {
        base,
        bias: image.bias,
        size: image.size,
        name,
        is_exe: false,
        is_ld: false,
        is_libc: false,
        symtab: info.symtab,
        strtab: info.strtab,
        hash: info.hash,
        gnu_hash: info.gnu_hash,
    })
}

/// All modules of a process: the executable first, then the link map.
///
/// Link-map entries that cannot be parsed are skipped; an unparseable
/// executable fails the whole enumeration.
pub fn enumerate_modules(mem: &dyn RemoteMemory, executable_base: u32) -> Result<Vec<Module>> {
    let mut exe = fill_module(mem, executable_base, String::new(), None)?;
    exe.is_exe = true;
    let mut modules = alloc::vec![exe];

    let Some(link) = locate_debug_link(mem, executable_base) else {
        debug!("elf: no debug link at {:#x}, executable only", executable_base);
        return Ok(modules);
    };

    let mut entry = link.map;
    for _ in 0..MAX_LINK_MAP_ENTRIES {
        if entry == 0 {
            break;
        }
        let l_addr = mem.read_u32(entry).or_else(invalid)?;
        let l_name = mem.read_u32(entry.wrapping_add(4)).or_else(invalid)?;
        let l_ld = mem.read_u32(entry.wrapping_add(8)).or_else(invalid)?;
        let next = mem.read_u32(entry.wrapping_add(12)).or_else(invalid)?;
        entry = next;

        if l_addr == 0 || l_addr == executable_base {
            continue;
        }
        let name = read_cstring(mem, l_name).unwrap_or_default();
        match fill_module(mem, l_addr, name, (l_ld != 0).then_some(l_ld)) {
            Ok(mut module) => {
                module.is_ld = l_addr == link.ld_base;
                modules.push(module);
            }
            Err(e) => warn!("elf: skipping module at {:#x}: {}", l_addr, e),
        }
    }

    if let Some(libc) = modules
        .iter_mut()
        .filter(|m| !m.is_exe && !m.is_ld)
        .find(|m| exports_pthread_create(mem, m))
    {
        libc.is_libc = true;
    }
    Ok(modules)
}

fn exports_pthread_create(mem: &dyn RemoteMemory, module: &Module) -> bool {
    matches!(
        lookup_symbol(mem, module, "pthread_create"),
        Some(Symbol {
            binding: Binding::Global,
            is_func: true,
            ..
        })
    )
}

/// SysV `DT_HASH` hash function.
pub fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &c in name.as_bytes() {
        h = (h << 4).wrapping_add(c as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// `DT_GNU_HASH` hash function.
pub fn gnu_hash(name: &str) -> u32 {
    name.as_bytes()
        .iter()
        .fold(5381u32, |h, &c| h.wrapping_mul(33).wrapping_add(c as u32))
}

struct RawSym {
    name: u32,
    value: u32,
    size: u32,
    info: u8,
    shndx: u16,
}

fn read_sym(mem: &dyn RemoteMemory, symtab: u32, idx: u32) -> Result<RawSym> {
    let at = symtab.wrapping_add(idx.wrapping_mul(SYM_SIZE));
    Ok(RawSym {
        name: mem.read_u32(at)?,
        value: mem.read_u32(at.wrapping_add(4))?,
        size: mem.read_u32(at.wrapping_add(8))?,
        info: mem.read_u8(at.wrapping_add(12))?,
        shndx: mem.read_u16(at.wrapping_add(14))?,
    })
}

/// Binding-aware candidate check. Returns `Some(true)` on a global match.
fn consider(
    mem: &dyn RemoteMemory,
    module: &Module,
    name: &str,
    idx: u32,
    best: &mut Option<Symbol>,
) -> Result<Option<bool>> {
    let sym = read_sym(mem, module.symtab, idx)?;
    if sym.shndx == SHN_UNDEF || sym.value == 0 {
        return Ok(None);
    }
    let binding = match sym.info >> 4 {
        STB_GLOBAL => Binding::Global,
        STB_WEAK => Binding::Weak,
        _ => return Ok(None),
    };
    if read_cstring(mem, module.strtab.wrapping_add(sym.name))? != name {
        return Ok(None);
    }
    *best = Some(Symbol {
        name: String::from(name),
        addr: module.bias.wrapping_add(sym.value),
        size: sym.size,
        binding,
        is_func: sym.info & 0xf == STT_FUNC,
    });
    Ok(Some(binding == Binding::Global))
}

fn lookup_sysv(mem: &dyn RemoteMemory, module: &Module, hash: u32, name: &str) -> Result<Option<Symbol>> {
    let nbucket = mem.read_u32(hash)?;
    let nchain = mem.read_u32(hash.wrapping_add(4))?;
    if nbucket == 0 {
        return Ok(None);
    }
    let buckets = hash.wrapping_add(8);
    let chains = buckets.wrapping_add(nbucket.wrapping_mul(4));

    let mut best = None;
    let mut idx = mem.read_u32(buckets.wrapping_add((elf_hash(name) % nbucket).wrapping_mul(4)))?;
    let mut steps = 0;
    while idx != 0 && idx < nchain && steps < nchain {
        if consider(mem, module, name, idx, &mut best)? == Some(true) {
            break;
        }
        idx = mem.read_u32(chains.wrapping_add(idx.wrapping_mul(4)))?;
        steps += 1;
    }
    Ok(best)
}

fn lookup_gnu(mem: &dyn RemoteMemory, module: &Module, table: u32, name: &str) -> Result<Option<Symbol>> {
    let nbuckets = mem.read_u32(table)?;
    let symoffset = mem.read_u32(table.wrapping_add(4))?;
    let bloom_size = mem.read_u32(table.wrapping_add(8))?;
    if nbuckets == 0 {
        return Ok(None);
    }
    let buckets = table.wrapping_add(16).wrapping_add(bloom_size.wrapping_mul(4));
    let chains = buckets.wrapping_add(nbuckets.wrapping_mul(4));

    let h = gnu_hash(name);
    let mut idx = mem.read_u32(buckets.wrapping_add((h % nbuckets).wrapping_mul(4)))?;
    if idx < symoffset {
        return Ok(None);
    }

    let mut best = None;
    for _ in 0..MAX_HASH_CHAIN {
        let chain = mem.read_u32(chains.wrapping_add((idx - symoffset).wrapping_mul(4)))?;
        if (chain | 1) == (h | 1) && consider(mem, module, name, idx, &mut best)? == Some(true) {
            break;
        }
        if chain & 1 != 0 || idx == u32::MAX {
            break;
        }
        idx += 1;
    }
    Ok(best)
}

/// Resolve `name` in one module.
///
/// A `GLOBAL` definition wins as soon as it is found; otherwise the last
/// `WEAK` definition on the chain is returned.
pub fn lookup_symbol(mem: &dyn RemoteMemory, module: &Module, name: &str) -> Option<Symbol> {
    if !module.has_symbols() {
        return None;
    }
    let result = match (module.hash, module.gnu_hash) {
        (Some(hash), _) => lookup_sysv(mem, module, hash, name),
        (None, Some(table)) => lookup_gnu(mem, module, table, name),
        (None, None) => Ok(None),
    };
    result.unwrap_or_else(|e| {
        warn!("elf: lookup of {} in {:#x} failed: {}", name, module.base, e);
        None
    })
}

/// First module (in iteration order) that defines `name`.
pub fn lookup_symbol_in_process<'m>(
    mem: &dyn RemoteMemory,
    modules: impl IntoIterator<Item = &'m Module>,
    name: &str,
) -> Option<(&'m Module, Symbol)> {
    modules
        .into_iter()
        .find_map(|m| lookup_symbol(mem, m, name).map(|s| (m, s)))
}
