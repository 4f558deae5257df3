use std::{
    cell::RefCell,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use orders::core::{ClipboardError, Template};
use orders::disciplinary::{DisciplinaryDraft, Person};
use orders::extra_fields::ExtraFieldsStore;
use orders::storage::Clipboard;
use orders::substitution::unresolved_tokens;
use orders::wizard::{WizardCategory, WizardForm};
use orders::{
    PreviewSource, SettingKey, SettingsStore, Storage, TemplateCatalog, build_header_line, copy,
    render_preview,
};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "orders",
    about = "Compose organization orders from templates and guided forms",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Key-value file holding settings, template fields and the disciplinary penalty.
    #[arg(long, global = true, env = "ORDERS_STORE", default_value = "orders-store.json")]
    store: PathBuf,
    /// JSON template catalog to use instead of the built-in one.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List templates in catalog order.
    List(ListArgs),

    /// List template categories in first-appearance order.
    Categories,

    /// Find templates by title, body or tag.
    Search(SearchArgs),

    /// Show or change the shared settings.
    #[command(subcommand)]
    Settings(SettingsCommand),

    /// Show or change a template's extra fields.
    #[command(subcommand)]
    Fields(FieldsCommand),

    /// Render a catalog template with the current settings and fields.
    Render(RenderArgs),

    /// Generate a document from the guided form.
    Wizard(WizardArgs),

    /// Set the penalty shared by disciplinary orders.
    Penalty(PenaltyArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Case-insensitive substring; empty matches everything.
    #[arg(default_value = "")]
    query: String,
    /// Restrict results to one category.
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    /// Print the settings and the header line they produce.
    Show,
    /// Update one setting.
    Set {
        key: SettingKey,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
}

#[derive(Debug, Subcommand)]
enum FieldsCommand {
    /// Print the template's field values.
    Show { template: String },
    /// Set one field or fragment flag.
    Set {
        template: String,
        key: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Forget every stored value for the template.
    Clear { template: String },
}

#[derive(Debug, Args)]
struct CopyArgs {
    /// Print the sanitized clipboard text instead of the raw preview.
    #[arg(long)]
    copy: bool,
    /// Also write the sanitized text to this file.
    #[arg(long, value_name = "PATH")]
    copy_to: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RenderArgs {
    template: String,
    #[command(flatten)]
    copy: CopyArgs,
}

#[derive(Debug, Args)]
struct WizardArgs {
    /// Category label, e.g. "Отпуск" or "Взыскания".
    category: String,
    #[arg(long, default_value = "")]
    target_name: String,
    #[arg(long, default_value = "")]
    target_position: String,
    /// Start date (YYYY-MM-DD renders as DD.MM.YYYY).
    #[arg(long, default_value = "")]
    date_from: String,
    #[arg(long, default_value = "")]
    date_to: String,
    #[arg(long, default_value = "")]
    reason: String,
    #[arg(long)]
    penalty_free: bool,
    /// Dismiss with a blacklist entry.
    #[arg(long)]
    ochs: bool,
    #[arg(long, default_value = "")]
    ochs_point: String,
    #[arg(long, default_value = "")]
    ochs_reason: String,
    #[arg(long, default_value = "")]
    blacklist_days: String,
    /// JSON array of people for disciplinary orders.
    #[arg(long, value_name = "PATH")]
    people: Option<PathBuf>,
    #[command(flatten)]
    copy: CopyArgs,
}

#[derive(Debug, Args)]
struct PenaltyArgs {
    text: String,
}

/// Stands in for the system clipboard by writing to the command output.
struct WriterClipboard<'a> {
    out: RefCell<&'a mut dyn Write>,
}

impl Clipboard for WriterClipboard<'_> {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut out = self.out.borrow_mut();
        writeln!(out, "{text}")?;
        Ok(())
    }
}

/// Writes copied text to a file so it can be piped into a system clipboard tool.
struct FileClipboard {
    path: PathBuf,
}

impl Clipboard for FileClipboard {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        fs::write(&self.path, text)?;
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let stdout = io::stdout();
    run(cli, &mut stdout.lock())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(cli: Cli, out: &mut dyn Write) -> Result<()> {
    let catalog = load_catalog(cli.catalog.as_deref())?;
    debug!(store = ?cli.store, "opening store");
    let storage = Storage::file(&cli.store);
    match cli.command {
        Commands::List(args) => {
            for t in catalog.search("", args.category.as_deref()) {
                writeln!(out, "{}\t{}\t{}", t.id, t.category, t.title)?;
            }
        }
        Commands::Categories => {
            for c in catalog.list_categories() {
                writeln!(out, "{c}")?;
            }
        }
        Commands::Search(args) => {
            for t in catalog.search(&args.query, args.category.as_deref()) {
                writeln!(out, "{}\t{}\t{}", t.id, t.category, t.title)?;
            }
        }
        Commands::Settings(cmd) => handle_settings(cmd, storage, out)?,
        Commands::Fields(cmd) => handle_fields(cmd, &catalog, storage, out)?,
        Commands::Render(args) => {
            let template = find_template(&catalog, &args.template)?;
            let settings = SettingsStore::open(storage.clone()).get();
            let extra = ExtraFieldsStore::new(storage).values(template);
            let text = render_preview(PreviewSource::Template { template, extra: &extra }, &settings);
            emit(&text, &args.copy, out)?;
        }
        Commands::Wizard(args) => handle_wizard(args, storage, out)?,
        Commands::Penalty(args) => {
            DisciplinaryDraft::open(storage).update_penalty(&args.text);
        }
    }
    Ok(())
}

fn load_catalog(path: Option<&Path>) -> Result<TemplateCatalog> {
    let Some(path) = path else {
        return Ok(TemplateCatalog::builtin());
    };
    let text = fs::read_to_string(path).with_context(|| format!("reading catalog {:?}", path))?;
    TemplateCatalog::from_json(&text).with_context(|| format!("loading catalog {:?}", path))
}

fn find_template<'a>(catalog: &'a TemplateCatalog, id: &str) -> Result<&'a Template> {
    match catalog.get(id) {
        Some(t) => Ok(t),
        None => bail!("no template with id {id:?}"),
    }
}

fn handle_settings(cmd: SettingsCommand, storage: Storage, out: &mut dyn Write) -> Result<()> {
    let store = SettingsStore::open(storage);
    if let SettingsCommand::Set { key, value } = cmd {
        store.update(key, &value);
    }
    let settings = store.get();
    writeln!(out, "{}", serde_json::to_string_pretty(&settings)?)?;
    writeln!(out, "{}", build_header_line(&settings))?;
    Ok(())
}

fn handle_fields(
    cmd: FieldsCommand,
    catalog: &TemplateCatalog,
    storage: Storage,
    out: &mut dyn Write,
) -> Result<()> {
    let store = ExtraFieldsStore::new(storage);
    let template = match &cmd {
        FieldsCommand::Show { template }
        | FieldsCommand::Set { template, .. }
        | FieldsCommand::Clear { template } => find_template(catalog, template)?,
    };
    match &cmd {
        FieldsCommand::Show { .. } => {}
        FieldsCommand::Set { key, value, .. } => store.set(template, key, value)?,
        FieldsCommand::Clear { .. } => store.clear(template),
    }
    for (key, value) in store.values(template) {
        writeln!(out, "{key}={value}")?;
    }
    Ok(())
}

fn handle_wizard(args: WizardArgs, storage: Storage, out: &mut dyn Write) -> Result<()> {
    let Some(category) = WizardCategory::from_label(&args.category) else {
        let known: Vec<&str> = WizardCategory::ALL.iter().map(|c| c.label()).collect();
        bail!("unknown category {:?}; expected one of {}", args.category, known.join(", "));
    };
    let form = WizardForm {
        target_name: args.target_name,
        target_position: args.target_position,
        date_from: args.date_from,
        date_to: args.date_to,
        reason: args.reason,
        is_penalty_free: args.penalty_free,
        is_ochs: args.ochs,
        ochs_point: args.ochs_point,
        ochs_reason: args.ochs_reason,
        blacklist_days: args.blacklist_days,
        ..WizardForm::new(category)
    };

    let settings = SettingsStore::open(storage.clone()).get();
    let draft = DisciplinaryDraft::open(storage);
    let mut disciplinary = draft.builder();
    if let Some(path) = &args.people {
        disciplinary.people.extend(load_people(path)?);
    }
    let text = render_preview(
        PreviewSource::Wizard {
            form: &form,
            disciplinary: &disciplinary,
        },
        &settings,
    );
    if text.is_empty() {
        bail!("nothing to render for {category}");
    }
    emit(&text, &args.copy, out)
}

fn load_people(path: &Path) -> Result<Vec<Person>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading people {:?}", path))?;
    let people: Vec<Person> =
        serde_json::from_str(&text).with_context(|| format!("parsing people {:?}", path))?;
    Ok(people.into_iter().map(Person::normalized).collect())
}

fn emit(text: &str, copy_args: &CopyArgs, out: &mut dyn Write) -> Result<()> {
    let missing = unresolved_tokens(text);
    if !missing.is_empty() {
        info!(?missing, "document still has unfilled tokens");
    }
    if copy_args.copy {
        let clipboard = WriterClipboard {
            out: RefCell::new(&mut *out),
        };
        if !copy(&clipboard, text) {
            bail!("could not write copied text");
        }
    } else {
        writeln!(out, "{text}")?;
    }
    if let Some(path) = &copy_args.copy_to {
        let clipboard = FileClipboard { path: path.clone() };
        if !copy(&clipboard, text) {
            bail!("could not write copy to {:?}", path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orders::sanitize_for_copy;

    fn run_args(store: &Path, args: &[&str]) -> String {
        let mut argv = vec!["orders", "--store", store.to_str().expect("utf-8 path")];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).expect("parse args");
        let mut out = Vec::<u8>::new();
        run(cli, &mut out).expect("run");
        String::from_utf8(out).expect("utf-8 output")
    }

    #[test]
    fn settings_persist_between_invocations() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store.json");

        run_args(&store, &["settings", "set", "myName", "Иванов"]);
        run_args(&store, &["settings", "set", "targetName", "Петров"]);
        let out = run_args(&store, &["render", "duty"]);

        assert!(out.starts_with("[Главный Врач ЦГБ города Мирный | Иванов]\n\n"));
        assert!(out.contains("Петров назначается ответственным дежурным ЦГБ города Мирный."));
    }

    #[test]
    fn fields_feed_render_and_copy() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store.json");
        let copied = tmp.path().join("copied.txt");

        run_args(&store, &["fields", "set", "bonus", "AMOUNT", "-50"]);
        let shown = run_args(&store, &["fields", "show", "bonus"]);
        assert!(shown.contains("AMOUNT=0\n"));

        run_args(&store, &["fields", "set", "bonus", "AMOUNT", "7000"]);
        let out = run_args(
            &store,
            &["render", "bonus", "--copy-to", copied.to_str().expect("utf-8 path")],
        );
        assert!(out.contains("в размере 7000 рублей за {MERIT}."));
        let clip = fs::read_to_string(&copied).expect("read copy");
        assert_eq!(clip, sanitize_for_copy(&out));
    }

    #[test]
    fn copy_flag_prints_sanitized_text() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store.json");

        let plain = run_args(&store, &["render", "duty"]);
        let copied = run_args(&store, &["render", "duty", "--copy"]);
        assert!(plain.contains("\n\n назначается"));
        assert_eq!(copied, format!("{}\n", sanitize_for_copy(&plain)));
    }

    #[test]
    fn negative_values_reach_the_normalizers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store.json");

        run_args(&store, &["settings", "set", "up", "4"]);
        let out = run_args(&store, &["settings", "set", "up", "-3"]);
        assert!(out.contains("\"up\": 0"));
    }

    #[test]
    fn list_filters_by_category() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store.json");

        let out = run_args(&store, &["list", "--category", "Взыскания"]);
        let ids: Vec<&str> = out.lines().filter_map(|l| l.split('\t').next()).collect();
        assert_eq!(ids, vec!["reprimand", "warning"]);
    }

    #[test]
    fn disciplinary_wizard_uses_stored_penalty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store.json");
        let people = tmp.path().join("people.json");
        fs::write(
            &people,
            r#"[{"name": "Сидоров", "position": "Интерн", "article": "2.1", "up": 7}]"#,
        )
        .expect("write people");

        run_args(&store, &["penalty", "выговора"]);
        let out = run_args(
            &store,
            &["wizard", "Взыскания", "--people", people.to_str().expect("utf-8 path")],
        );
        assert!(out.contains("получает взыскание в виде выговора"));
        assert!(out.contains("УП-5/5, П-0/5, В-0/3."));
    }

    #[test]
    fn unknown_template_and_category_fail() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store.json");
        for args in [&["render", "missing"][..], &["wizard", "Праздник"][..]] {
            let mut argv = vec!["orders", "--store", store.to_str().expect("utf-8 path")];
            argv.extend_from_slice(args);
            let cli = Cli::try_parse_from(argv).expect("parse args");
            assert!(run(cli, &mut Vec::<u8>::new()).is_err());
        }
    }

    #[test]
    fn custom_catalog_is_loaded_from_json() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let catalog = tmp.path().join("catalog.json");
        fs::write(
            &catalog,
            r#"[{"id": "memo", "title": "Памятка", "category": "Общие", "body": "[Своя шапка]\n\nТекст"}]"#,
        )
        .expect("write catalog");

        let loaded = load_catalog(Some(catalog.as_path())).expect("load catalog");
        assert_eq!(loaded.list_categories(), vec!["Общие"]);
        assert!(loaded.get("memo").is_some_and(|t| t.has_header()));
    }
}
