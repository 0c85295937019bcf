pub mod demo;

use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::Value;
use tracing::info;

use crate::comm::config::{set_global_config_manager, ConfigManager, ConfigSource};
use crate::comm::tracing::{init_tracing, init_tracing_with_error_log};
use crate::db::connection::{DatabaseManager, Db};

fn db_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("dsn")
            .long("dsn")
            .value_name("DSN")
            .help("连接串，支持 mysql:// URL 与 user@tcp(host)/db 格式"),
    )
    .arg(
        Arg::new("group")
            .short('g')
            .long("group")
            .value_name("GROUP")
            .help("配置中的数据库分组 database.<group>")
            .default_value("default"),
    )
}

fn sql_args(cmd: Command) -> Command {
    db_args(cmd)
        .arg(Arg::new("sql").value_name("SQL").required(true).help("SQL 语句，参数使用 ?"))
        .arg(
            Arg::new("args")
                .value_name("ARGS")
                .num_args(0..)
                .help("绑定参数，按 JSON 解析，失败时作为字符串"),
        )
}

/// 构建命令行应用 / Build the command-line app
pub fn build_app() -> Command {
    Command::new("dbx")
        .version(env!("CARGO_PKG_VERSION"))
        .about("MySQL 表查询与行缓存工具")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("额外的配置文件，优先级最高"),
        )
        .subcommand(
            db_args(Command::new("demo").about("运行 user 表的增删改查演示"))
                .arg(
                    Arg::new("no-cache")
                        .long("no-cache")
                        .help("关闭行缓存")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("error-log")
                        .long("error-log")
                        .value_name("FILE")
                        .help("错误日志文件")
                        .default_value("./db1_error.log"),
                ),
        )
        .subcommand(db_args(Command::new("ping").about("检查数据库连接")))
        .subcommand(sql_args(Command::new("exec").about("执行写语句")))
        .subcommand(sql_args(Command::new("query").about("执行查询，按 JSON 行输出")))
}

/// 处理命令 / Dispatch a parsed command line
pub async fn run(matches: &ArgMatches) -> Result<()> {
    if let Some(path) = matches.get_one::<String>("config") {
        let mgr = ConfigManager::with_sources(vec![ConfigSource::File {
            path: path.clone(),
            format: None,
            required: true,
        }])?;
        set_global_config_manager(mgr)?;
    }

    match matches.subcommand() {
        Some(("demo", sub)) => {
            let log = sub
                .get_one::<String>("error-log")
                .map(String::as_str)
                .unwrap_or("./db1_error.log");
            init_tracing_with_error_log(log)?;
            let cache = !sub.get_flag("no-cache");
            let db = match sub.get_one::<String>("dsn") {
                Some(dsn) => Db::open_with(dsn, demo::demo_pool())?,
                None => resolve_db(sub)?,
            };
            let res = demo::run_demo(&db, cache).await;
            db.close().await;
            res.map(|_| ())
        }
        Some(("ping", sub)) => {
            init_tracing()?;
            let db = resolve_db(sub)?;
            db.ping().await.with_context(|| format!("连接失败: {}", db.label()))?;
            println!("ok: {}", db.label());
            db.close().await;
            Ok(())
        }
        Some(("exec", sub)) => {
            init_tracing()?;
            let db = resolve_db(sub)?;
            let (sql, args) = sql_and_args(sub)?;
            let r = db.exec(&sql, args).await?;
            println!(
                "rows_affected: {}, last_insert_id: {}",
                r.rows_affected, r.last_insert_id
            );
            db.close().await;
            Ok(())
        }
        Some(("query", sub)) => {
            init_tracing()?;
            let db = resolve_db(sub)?;
            let (sql, args) = sql_and_args(sub)?;
            let rows = db.query(&sql, args).await?;
            for row in rows {
                println!("{}", row.into_json());
            }
            db.close().await;
            Ok(())
        }
        Some((other, _)) => Err(anyhow!("未知命令: {}", other)),
        None => Err(anyhow!("缺少子命令")),
    }
}

/// `--dsn` 优先，否则按 `--group` 读取配置
fn resolve_db(matches: &ArgMatches) -> Result<Db> {
    if let Some(dsn) = matches.get_one::<String>("dsn") {
        return Ok(Db::open(dsn)?);
    }
    let group = matches
        .get_one::<String>("group")
        .map(String::as_str)
        .unwrap_or("default");
    info!(target: "dbx", "using database group '{}'", group);
    Ok(DatabaseManager::get(group)?)
}

fn sql_and_args(matches: &ArgMatches) -> Result<(String, Vec<Value>)> {
    let sql = matches
        .get_one::<String>("sql")
        .cloned()
        .ok_or_else(|| anyhow!("缺少 SQL"))?;
    let args = matches
        .get_many::<String>("args")
        .map(|vals| vals.map(|s| parse_cli_arg(s)).collect())
        .unwrap_or_default();
    Ok((sql, args))
}

/// 命令行参数按 JSON 解析（数字、布尔、null），否则视为字符串
pub fn parse_cli_arg(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_app_parses_subcommands() {
        let m = build_app()
            .try_get_matches_from(["dbx", "query", "--dsn", "root@tcp(h)/db", "SELECT ?", "1", "jet"])
            .unwrap();
        let (name, sub) = m.subcommand().unwrap();
        assert_eq!(name, "query");
        let (sql, args) = sql_and_args(sub).unwrap();
        assert_eq!(sql, "SELECT ?");
        assert_eq!(args, vec![json!(1), json!("jet")]);

        let m = build_app().try_get_matches_from(["dbx", "demo", "--no-cache"]).unwrap();
        let (_, sub) = m.subcommand().unwrap();
        assert!(sub.get_flag("no-cache"));
        assert_eq!(sub.get_one::<String>("group").unwrap(), "default");
        assert_eq!(sub.get_one::<String>("error-log").unwrap(), "./db1_error.log");

        assert!(build_app().try_get_matches_from(["dbx"]).is_err());
    }

    #[test]
    fn test_parse_cli_arg() {
        assert_eq!(parse_cli_arg("42"), json!(42));
        assert_eq!(parse_cli_arg("true"), json!(true));
        assert_eq!(parse_cli_arg("null"), Value::Null);
        assert_eq!(parse_cli_arg("jet"), json!("jet"));
    }
}
