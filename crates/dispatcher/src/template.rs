use std::collections::BTreeMap;

use minijinja::{Environment, UndefinedBehavior};

use scheduler_errors::{SchedulerError, SchedulerResult};

/// 提交脚本模板支持的占位符
pub const PLACEHOLDERS: [&str; 14] = [
    "host",
    "key",
    "name",
    "walltime",
    "nodes",
    "ppn",
    "threads",
    "header",
    "mpi",
    "binary",
    "pipes",
    "footer",
    "cpu_per_core",
    "cpu_per_task",
];

/// minijinja 中输出字面左花括号的表达式
const LEFT_BRACE: &str = r#"{{ "{" }}"#;

/// 渲染提交脚本模板
///
/// `{name}` 替换为对应值，`{{` 和 `}}` 输出字面的花括号。`${VAR}` 原样保留给 shell。
/// 未知占位符或缺少取值都视为分配配置错误。
pub fn render_template(template: &str, values: &BTreeMap<&str, String>) -> SchedulerResult<String> {
    let source = to_jinja(template)?;

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.render_str(&source, values)
        .map_err(|e| SchedulerError::misconfigured(format!("模板渲染失败: {e}")))
}

/// 把占位符模板转换为 minijinja 源码
///
/// 字面的左花括号一律改写为表达式，转换结果中只有占位符会被 minijinja 解释。
fn to_jinja(template: &str) -> SchedulerResult<String> {
    let mut out = String::with_capacity(template.len() + 128);
    let mut chars = template.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        match c {
            '{' if chars.next_if(|(_, n)| *n == '{').is_some() => out.push_str(LEFT_BRACE),
            '}' if chars.next_if(|(_, n)| *n == '}').is_some() => out.push('}'),
            '$' if chars.peek().is_some_and(|(_, n)| *n == '{') => {
                out.push('$');
                for (_, inner) in chars.by_ref() {
                    push_literal(&mut out, inner);
                    if inner == '}' {
                        break;
                    }
                }
            }
            '{' => {
                let rest = &template[index + 1..];
                let end = rest.find('}').ok_or_else(|| {
                    SchedulerError::misconfigured(format!("模板在位置 {index} 处缺少右花括号"))
                })?;
                let name = &rest[..end];
                if !PLACEHOLDERS.contains(&name) {
                    return Err(SchedulerError::misconfigured(format!(
                        "模板包含未知占位符: {{{name}}}"
                    )));
                }
                out.push_str("{{ ");
                out.push_str(name);
                out.push_str(" }}");
                let close = index + 1 + end;
                while chars.next_if(|(i, _)| *i <= close).is_some() {}
            }
            other => push_literal(&mut out, other),
        }
    }
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if c == '{' {
        out.push_str(LEFT_BRACE);
    } else {
        out.push(c);
    }
}
