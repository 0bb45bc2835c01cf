//! Minimal ELF32 images laid out directly in a mock address space.
//!
//! Layout, as offsets from the load base:
//!
//! | offset  | contents                      |
//! |---------|-------------------------------|
//! | 0x000   | ELF header, 2 program headers |
//! | 0x100   | dynamic section               |
//! | 0x400   | free for code and data        |
//! | 0x1000  | SysV hash table               |
//! | 0x1400  | string table                  |
//! | 0x1a00  | symbol table (96 entries)     |

use super::host::MockHost;
use uhook::Pid;

pub const IMAGE_SIZE: u32 = 0x2000;
const DYN_OFF: u32 = 0x100;
const HASH_OFF: u32 = 0x1000;
const STR_OFF: u32 = 0x1400;
const SYM_OFF: u32 = 0x1a00;

const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

struct Sym {
    name: String,
    addr: u32,
    info: u8,
}

pub struct ElfImage {
    base: u32,
    shared: bool,
    entry: u32,
    debug: Option<u32>,
    symbols: Vec<Sym>,
}

impl ElfImage {
    /// `ET_EXEC` image linked at `base`.
    pub fn executable(base: u32) -> Self {
        Self {
            base,
            shared: false,
            entry: base + 0x400,
            debug: None,
            symbols: Vec::new(),
        }
    }

    /// `ET_DYN` image loaded at `base`.
    pub fn shared(base: u32) -> Self {
        Self {
            shared: true,
            ..Self::executable(base)
        }
    }

    fn bias(&self) -> u32 {
        if self.shared { self.base } else { 0 }
    }

    /// Address as stored in the image (relative for shared objects).
    fn vaddr(&self, addr: u32) -> u32 {
        addr - self.bias()
    }

    pub fn entry(mut self, addr: u32) -> Self {
        self.entry = addr;
        self
    }

    /// `DT_DEBUG` pointing at an `r_debug` at `addr`.
    pub fn debug(mut self, addr: u32) -> Self {
        self.debug = Some(addr);
        self
    }

    fn symbol(mut self, name: &str, addr: u32, info: u8) -> Self {
        self.symbols.push(Sym {
            name: name.to_string(),
            addr,
            info,
        });
        self
    }

    /// Global function at a (mode-tagged) runtime address.
    pub fn function(self, name: &str, addr: u32) -> Self {
        self.symbol(name, addr, (STB_GLOBAL << 4) | STT_FUNC)
    }

    pub fn weak_function(self, name: &str, addr: u32) -> Self {
        self.symbol(name, addr, (STB_WEAK << 4) | STT_FUNC)
    }

    pub fn object(self, name: &str, addr: u32) -> Self {
        self.symbol(name, addr, (STB_GLOBAL << 4) | STT_OBJECT)
    }

    pub fn dynamic_addr(&self) -> u32 {
        self.base + DYN_OFF
    }

    pub fn load(&self, host: &MockHost, pid: Pid) {
        let base = self.base;
        host.map(pid, base, IMAGE_SIZE);

        // ELF header
        let mut hdr = vec![0u8; 52];
        hdr[..7].copy_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1]);
        hdr[16..18].copy_from_slice(&(if self.shared { 3u16 } else { 2u16 }).to_le_bytes());
        hdr[18..20].copy_from_slice(&40u16.to_le_bytes());
        hdr[20..24].copy_from_slice(&1u32.to_le_bytes());
        hdr[24..28].copy_from_slice(&self.vaddr(self.entry).to_le_bytes());
        hdr[28..32].copy_from_slice(&52u32.to_le_bytes());
        hdr[40..42].copy_from_slice(&52u16.to_le_bytes());
        hdr[42..44].copy_from_slice(&32u16.to_le_bytes());
        hdr[44..46].copy_from_slice(&2u16.to_le_bytes());
        host.load(pid, base, &hdr);

        // PT_LOAD covering the image, PT_DYNAMIC
        let phdrs = [
            [1, 0, self.vaddr(base), self.vaddr(base), IMAGE_SIZE, IMAGE_SIZE, 5, PAGE_ALIGN],
            [2, DYN_OFF, self.vaddr(base + DYN_OFF), 0, 0x40, 0x40, 6, 4],
        ];
        for (i, ph) in phdrs.iter().enumerate() {
            for (j, word) in ph.iter().enumerate() {
                host.poke_u32(pid, base + 52 + i as u32 * 32 + j as u32 * 4, *word);
            }
        }

        // string and symbol tables; symbol 0 is the null symbol
        let mut strtab = vec![0u8];
        let mut syms = vec![[0u8; 16]];
        for sym in &self.symbols {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
            let mut raw = [0u8; 16];
            raw[0..4].copy_from_slice(&name_off.to_le_bytes());
            raw[4..8].copy_from_slice(&self.vaddr(sym.addr).to_le_bytes());
            raw[8..12].copy_from_slice(&0x40u32.to_le_bytes());
            raw[12] = sym.info;
            raw[14..16].copy_from_slice(&1u16.to_le_bytes());
            syms.push(raw);
        }
        assert!(strtab.len() <= 0x600 && syms.len() <= 96, "image tables overflow");
        host.load(pid, base + STR_OFF, &strtab);
        host.load(pid, base + SYM_OFF, &syms.concat());

        // one bucket chaining every symbol, last to first
        let nchain = syms.len() as u32;
        let mut hash = vec![1, nchain, nchain - 1];
        hash.extend((0..nchain).map(|i| i.saturating_sub(1)));
        let bytes: Vec<u8> = hash.iter().flat_map(|w: &u32| w.to_le_bytes()).collect();
        host.load(pid, base + HASH_OFF, &bytes);

        let table = |off: u32| if self.shared { off } else { base + off };
        let mut dynamic = vec![(4, table(HASH_OFF)), (5, table(STR_OFF)), (6, table(SYM_OFF))];
        if let Some(debug) = self.debug {
            dynamic.push((21, debug));
        }
        dynamic.push((0, 0));
        for (i, (tag, val)) in dynamic.iter().enumerate() {
            host.poke_u32(pid, base + DYN_OFF + i as u32 * 8, *tag);
            host.poke_u32(pid, base + DYN_OFF + i as u32 * 8 + 4, *val);
        }
    }
}

const PAGE_ALIGN: u32 = 0x1000;

/// Write an `r_debug` at `at` whose link map lists `(l_addr, name, l_ld)`.
///
/// The executable's own entry (l_addr 0) goes first, as the loader does it.
pub fn link_map(host: &MockHost, pid: Pid, at: u32, ld_base: u32, modules: &[(u32, &str, u32)]) {
    let first = at + 0x20;
    let names = at + 0x200;
    host.map(pid, at, 0x400);

    host.poke_u32(pid, at, 1);
    host.poke_u32(pid, at + 4, first);
    host.poke_u32(pid, at + 16, ld_base);

    let entries: Vec<(u32, &str, u32)> = std::iter::once((0, "", 0)).chain(modules.iter().copied()).collect();
    let mut name_at = names;
    for (i, (l_addr, name, l_ld)) in entries.iter().enumerate() {
        let node = first + i as u32 * 20;
        let next = if i + 1 < entries.len() { node + 20 } else { 0 };
        let prev = if i == 0 { 0 } else { node - 20 };
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        host.load(pid, name_at, &bytes);
        for (j, w) in [*l_addr, name_at, *l_ld, next, prev].iter().enumerate() {
            host.poke_u32(pid, node + j as u32 * 4, *w);
        }
        name_at += bytes.len() as u32;
    }
}
