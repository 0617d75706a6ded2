//! Command-line arguments and terminal rendering of pipeline events.

use std::io::{self, Write};

use clap::Parser;

use crate::credits::Mode;
use crate::pipeline::PipelineEvent;
use crate::search::source::Source;
use crate::text::{link_target, link_text};

#[derive(Debug, Parser)]
#[command(name = "deepquery", version, about = "Answer a question from live web research")]
pub struct Cli {
    /// The question to research
    pub query: String,

    /// How much research to do
    #[arg(short, long, value_enum, default_value_t = Mode::Research)]
    pub mode: Mode,

    /// Primary LLM provider (openai, groq, anthropic, gemini); overrides LLM_PROVIDER
    #[arg(short, long)]
    pub provider: Option<String>,

    /// Bill the run to this user instead of the anonymous daily allowance
    #[arg(short, long)]
    pub user: Option<String>,

    /// Starting credit balance for --user
    #[arg(long, default_value_t = 20, requires = "user")]
    pub balance: u32,

    /// Skip the proofreading pass
    #[arg(long)]
    pub no_proofread: bool,

    /// Print events as JSON lines instead of markdown
    #[arg(long)]
    pub json: bool,
}

/// Writes the answer to `out` and progress to `status`.
pub struct Printer<O: Write, S: Write> {
    out: O,
    status: S,
    json: bool,
    sources: Vec<Source>,
    failed: bool,
}

impl Printer<io::Stdout, io::Stderr> {
    pub fn terminal(json: bool) -> Self {
        Self::new(io::stdout(), io::stderr(), json)
    }
}

impl<O: Write, S: Write> Printer<O, S> {
    pub fn new(out: O, status: S, json: bool) -> Self {
        Self {
            out,
            status,
            json,
            sources: Vec::new(),
            failed: false,
        }
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn print(&mut self, event: &PipelineEvent) -> io::Result<()> {
        if matches!(event, PipelineEvent::Error(_)) {
            self.failed = true;
        }
        if self.json {
            let line = serde_json::to_string(event).map_err(io::Error::other)?;
            return writeln!(self.out, "{line}");
        }

        match event {
            PipelineEvent::Stage(stage) => writeln!(self.status, "> {stage}...")?,
            PipelineEvent::Plan { category, items } => {
                if let Some(category) = category {
                    writeln!(self.status, "  category: {category}")?;
                }
                for item in items {
                    writeln!(self.status, "  - {}: {}", item.aspect, item.query)?;
                }
            }
            PipelineEvent::Sources(sources) => {
                writeln!(self.status, "  {} sources", sources.len())?;
                self.sources = sources.clone();
            }
            PipelineEvent::Images(images) => writeln!(self.status, "  {} images", images.len())?,
            PipelineEvent::Content(chunk) => {
                write!(self.out, "{chunk}")?;
                self.out.flush()?;
            }
            PipelineEvent::Usage {
                input_tokens,
                output_tokens,
                estimated,
            } => {
                let approx = if *estimated { "~" } else { "" };
                writeln!(
                    self.status,
                    "\n  tokens: {approx}{input_tokens} in, {approx}{output_tokens} out"
                )?;
            }
            // The streamed answer is already on screen; the corrected copy is
            // what the cache replays next time.
            PipelineEvent::Proofread(text) => writeln!(
                self.status,
                "\n  proofread: revised answer ({} chars) saved for repeat queries",
                text.chars().count()
            )?,
            PipelineEvent::Error(message) => writeln!(self.status, "\nerror: {message}")?,
            PipelineEvent::Done {
                cached,
                credits_charged,
            } => {
                self.write_sources()?;
                let origin = if *cached { " (cached)" } else { "" };
                writeln!(self.status, "done{origin}, {credits_charged} credits charged")?;
            }
        }
        Ok(())
    }

    fn write_sources(&mut self) -> io::Result<()> {
        if self.sources.is_empty() {
            return writeln!(self.out);
        }
        write!(self.out, "\n\n---\n**Sources:**\n")?;
        for source in &self.sources {
            writeln!(
                self.out,
                "{}. [{}]({}) - {}, {}",
                source.id,
                link_text(&source.title),
                link_target(&source.url),
                source.domain,
                source.time_ago
            )?;
        }
        Ok(())
    }
}
