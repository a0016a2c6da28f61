#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RawArgCommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg_key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[RawArgCommandSpec] = &[
    RawArgCommandSpec {
        command: "text_model",
        action: "set_text_model",
        arg_key: "model",
    },
    RawArgCommandSpec {
        command: "image_model",
        action: "set_image_model",
        arg_key: "model",
    },
    RawArgCommandSpec {
        command: "occasion",
        action: "set_occasion",
        arg_key: "occasion",
    },
    RawArgCommandSpec {
        command: "curate",
        action: "curate",
        arg_key: "occasion",
    },
    RawArgCommandSpec {
        command: "remove",
        action: "remove_item",
        arg_key: "id",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "person",
    action: "set_person_image",
}];

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "add",
    action: "add_items",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "wardrobe",
        action: "list_wardrobe",
    },
    CommandSpec {
        command: "outfits",
        action: "list_outfits",
    },
    CommandSpec {
        command: "save",
        action: "save_outfit",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/help",
    "/reset",
    "/quit",
    "/text_model",
    "/image_model",
    "/occasion",
    "/add",
    "/person",
    "/remove",
    "/wardrobe",
    "/outfits",
    "/curate",
    "/save",
];
