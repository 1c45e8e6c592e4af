//! シンボル解決サービス
//!
//! モジュール（エージェントから報告されたロード済みバイナリ）ごとに
//! ELFのシンボルテーブルを読み、関数名とアドレスを相互に引けるようにします。

use kokia_wire::Module;
use object::{Object, ObjectKind, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use tracing::{debug, warn};

/// アドレスから引いた関数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    /// デマングル後の名前
    pub name: String,
    /// ロード後のアドレス
    pub address: u64,
    pub size: u64,
}

/// ブレークポイントの解決と表示に使うシンボルサービス
pub trait SymbolService {
    /// モジュールのロードを知らせる
    fn module_loaded(&mut self, _module: &Module) {}

    /// 関数名をロード後のアドレスに解決する
    fn resolve_function(&self, module: &Module, name: &str) -> Vec<u64>;

    /// アドレスを含む関数を探す
    fn function_at(&self, modules: &[Module], address: u64) -> Option<FunctionSymbol>;
}

/// シンボルを持たないサービス
#[derive(Debug, Default)]
pub struct NoSymbols;

impl SymbolService for NoSymbols {
    fn resolve_function(&self, _module: &Module, _name: &str) -> Vec<u64> {
        Vec::new()
    }

    fn function_at(&self, _modules: &[Module], _address: u64) -> Option<FunctionSymbol> {
        None
    }
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    demangled_name: String,
    /// ファイル内のアドレス
    address: u64,
    size: u64,
}

/// シンボル名をデマングルする（Rustのみ）
fn demangle_symbol(name: &str) -> String {
    match rustc_demangle::try_demangle(name) {
        Ok(demangled) => format!("{:#}", demangled),
        Err(_) => name.to_string(),
    }
}

/// 1つのELFファイルのシンボルテーブル
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_address: Vec<Symbol>,
    by_name: HashMap<String, Vec<usize>>,
    /// PIEや共有ライブラリはモジュールのベースだけずらす
    relocatable: bool,
}

impl SymbolTable {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let file = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse object file: {}", e))?;

        let mut by_address: Vec<Symbol> = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|s| s.kind() == SymbolKind::Text && s.address() != 0)
            .filter_map(|s| {
                let name = s.name().ok()?;
                (!name.is_empty()).then(|| Symbol {
                    name: name.to_string(),
                    demangled_name: demangle_symbol(name),
                    address: s.address(),
                    size: s.size(),
                })
            })
            .collect();
        by_address.sort_by(|a, b| (a.address, &a.name).cmp(&(b.address, &b.name)));
        by_address.dedup_by(|a, b| a.address == b.address && a.name == b.name);

        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, symbol) in by_address.iter().enumerate() {
            by_name.entry(symbol.name.clone()).or_default().push(index);
            if symbol.demangled_name != symbol.name {
                by_name.entry(symbol.demangled_name.clone()).or_default().push(index);
            }
        }

        Ok(Self {
            by_address,
            by_name,
            relocatable: matches!(file.kind(), ObjectKind::Dynamic),
        })
    }

    fn bias(&self, base: u64) -> u64 {
        if self.relocatable {
            base
        } else {
            0
        }
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// マングル名かデマングル名で引く
    pub fn resolve(&self, name: &str, base: u64) -> Vec<u64> {
        let bias = self.bias(base);
        let mut addresses: Vec<u64> = self
            .by_name
            .get(name)
            .into_iter()
            .flatten()
            .map(|&i| self.by_address[i].address.wrapping_add(bias))
            .collect();
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    pub fn function_at(&self, address: u64, base: u64) -> Option<FunctionSymbol> {
        let bias = self.bias(base);
        let file_address = address.checked_sub(bias)?;
        let idx = self.by_address.partition_point(|s| s.address <= file_address);
        let symbol = self.by_address.get(idx.checked_sub(1)?)?;
        if symbol.size > 0 && file_address >= symbol.address + symbol.size {
            return None;
        }
        Some(FunctionSymbol {
            name: symbol.demangled_name.clone(),
            address: symbol.address.wrapping_add(bias),
            size: symbol.size,
        })
    }
}

/// モジュール名（ファイルパス）をキーにしたELFシンボルサービス
#[derive(Debug, Default)]
pub struct ElfSymbols {
    tables: HashMap<String, SymbolTable>,
}

impl ElfSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// ファイルを読み込んでモジュール名に登録する
    pub fn load(&mut self, module_name: &str, path: &std::path::Path) -> anyhow::Result<()> {
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let table = SymbolTable::parse(&data)?;
        debug!("Loaded {} symbols for {}", table.len(), module_name);
        self.tables.insert(module_name.to_string(), table);
        Ok(())
    }

    pub fn has_module(&self, module_name: &str) -> bool {
        self.tables.contains_key(module_name)
    }
}

impl SymbolService for ElfSymbols {
    fn module_loaded(&mut self, module: &Module) {
        if self.has_module(&module.name) {
            return;
        }
        let path = std::path::PathBuf::from(&module.name);
        if let Err(e) = self.load(&module.name, &path) {
            warn!("No symbols for {}: {}", module.name, e);
        }
    }

    fn resolve_function(&self, module: &Module, name: &str) -> Vec<u64> {
        self.tables
            .get(&module.name)
            .map(|table| table.resolve(name, module.base))
            .unwrap_or_default()
    }

    fn function_at(&self, modules: &[Module], address: u64) -> Option<FunctionSymbol> {
        modules
            .iter()
            .filter(|m| m.base <= address)
            .max_by_key(|m| m.base)
            .and_then(|m| self.tables.get(&m.name)?.function_at(address, m.base))
    }
}
