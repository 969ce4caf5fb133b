// Script resolution and `require`.
//
// `require` keeps the preload searcher and replaces every other searcher with
// one that resolves through the VM's base paths and content provider, so
// scripts never touch the file system directly.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use mlua::{ChunkMode, Function, Lua, Value};

use crate::call;
use crate::compiled_unit::{CompiledScriptUnit, UnitKind};
use crate::error::ContentError;

use super::VmShared;

pub(super) const CODE_CHUNK_NAME: &str = "[code]";

const SEARCHER_SOURCE: &str = r#"
local resolve = ...
local error = error
local preload = package.searchers[1]
package.searchers = {
  preload,
  function(name)
    local loader, err = resolve(name)
    if loader == nil then error(err, 0) end
    return loader, name
  end,
}
"#;

pub(super) fn chunk_name(relative: &str) -> String {
    format!("@{relative}")
}

fn not_loaded(name: &str, reason: &str) -> String {
    format!("error loading module '{name}':\nstack:\n\t'{reason}'")
}

/// Joins `name` onto each base path in order and returns the first file the
/// content provider can see, plus the normalized relative name.
pub(super) fn resolve_relative(shared: &VmShared, name: &str) -> Option<(PathBuf, String)> {
    let mut relative = name.replace('\\', "/");
    if !relative.ends_with(".lua") {
        relative.push_str(".lua");
    }
    let escapes = Path::new(&relative).components().any(|c| {
        matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if escapes || name.is_empty() {
        return None;
    }

    shared
        .settings
        .base_paths
        .iter()
        .find_map(|base| shared.content.resolve(base, &relative))
        .map(|path| (path, relative))
}

/// Loads through the content provider, refusing source units whenever the
/// settings disable source fallback. Custom providers are held to the same rule.
pub(super) fn load_content(shared: &VmShared, path: &Path) -> Result<CompiledScriptUnit, ContentError> {
    let unit = shared.content.load(path)?;
    if unit.kind() == UnitKind::Source && !shared.settings.source_fallback_enabled() {
        return Err(ContentError::SourceNotAllowed(path.to_path_buf()));
    }
    Ok(unit)
}

pub(super) fn load_unit(lua: &Lua, unit: &CompiledScriptUnit, chunk_name: &str) -> mlua::Result<Function> {
    let mode = match unit.kind() {
        UnitKind::Bytecode => ChunkMode::Binary,
        UnitKind::Source => ChunkMode::Text,
    };
    lua.load(unit.bytes())
        .set_name(chunk_name)
        .set_mode(mode)
        .into_function()
}

pub(super) fn install(lua: &Lua, shared: &Arc<VmShared>) -> mlua::Result<()> {
    let shared = Arc::clone(shared);
    let resolve = lua.create_function(move |lua, name: String| -> mlua::Result<(Value, Value)> {
        let fail = |message: String| -> mlua::Result<(Value, Value)> {
            Ok((Value::Nil, Value::String(lua.create_string(message)?)))
        };

        if shared.is_interrupted() {
            return fail("interrupted".to_string());
        }
        // Never exposed, even when a script of that name exists.
        if name == "os" {
            return fail(format!(
                "error loading module '{name}':\n\tfile not found or error reading file."
            ));
        }

        let module = name.replace('.', "/");
        let Some((path, relative)) = resolve_relative(&shared, &module) else {
            return fail(not_loaded(&name, "file not found or error reading file."));
        };
        let unit = match load_content(&shared, &path) {
            Ok(unit) => unit,
            Err(e) => return fail(not_loaded(&name, &e.to_string())),
        };
        shared.hot_load.record_script(&path);
        match load_unit(lua, &unit, &chunk_name(&relative)) {
            Ok(loader) => Ok((Value::Function(loader), Value::Nil)),
            Err(e) => fail(not_loaded(&name, &call::error_reason(&e))),
        }
    })?;

    lua.load(SEARCHER_SOURCE)
        .set_name("=[require]")
        .call::<()>(resolve)
}
