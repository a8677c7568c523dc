use std::path::PathBuf;

use argh::FromArgs;
use llava_eval::llava::{Llava, LlavaOptions};

#[derive(FromArgs)]
/// Answer a question about an image with a LLaVA checkpoint bundle.
struct Args {
    /// checkpoint bundle: local directory or hub repo id
    #[argh(option)]
    bundle: String,

    /// path to the image to ask about
    #[argh(option)]
    image: PathBuf,

    /// the question to ask
    #[argh(option)]
    prompt: String,

    /// explicit language model path (bundles without an llm/ directory)
    #[argh(option)]
    llm_path: Option<PathBuf>,

    /// explicit visual encoder path (bundles without a visual_encoder/ directory)
    #[argh(option)]
    visual_encoder_path: Option<PathBuf>,

    /// instruction template name (e.g. vicuna, internlm2_chat)
    #[argh(option)]
    prompt_template: Option<String>,

    /// cap on generated tokens
    #[argh(option)]
    max_new_tokens: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let mut options = LlavaOptions::new(args.bundle);
    options.llm_path = args.llm_path;
    options.visual_encoder_path = args.visual_encoder_path;
    options.prompt_template = args.prompt_template;
    options.generation.max_new_tokens = args.max_new_tokens;

    let mut model = Llava::new(options)?;
    let answer = model.generate(&args.image, &args.prompt, None)?;
    println!("{answer}");

    Ok(())
}
