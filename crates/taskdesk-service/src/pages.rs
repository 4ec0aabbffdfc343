use std::fmt::Write as _;

use taskdesk_core::{AuthUser, Task, TaskList, TaskStatus, AUTH_CALLBACK_FAILED};

const STYLE: &str = "body{font-family:system-ui,sans-serif;max-width:40rem;margin:2rem auto;padding:0 1rem}\
.error{color:#b00020}.done{text-decoration:line-through;color:#777}\
ul{list-style:none;padding:0}li{display:flex;gap:.5rem;align-items:center;padding:.25rem 0}\
li form{margin:0}.meta{color:#555;font-size:.85rem}";

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n{body}</body>\n</html>\n",
        escape_html(title)
    )
}

fn push_alert(body: &mut String, message: &str) {
    let _ = writeln!(body, "<p class=\"error\" role=\"alert\">{}</p>", escape_html(message));
}

fn error_text(code: &str) -> &'static str {
    if code == AUTH_CALLBACK_FAILED {
        "Sign-in failed. Please try again."
    } else {
        "Something went wrong. Please try again."
    }
}

pub fn home_page(user: Option<&AuthUser>, error_code: Option<&str>, flash: Option<&str>) -> String {
    let mut body = String::from("<h1>TaskDesk</h1>\n");
    if let Some(code) = error_code {
        push_alert(&mut body, error_text(code));
    }
    if let Some(message) = flash {
        push_alert(&mut body, message);
    }
    match user {
        Some(user) => {
            let who = user.email.as_deref().unwrap_or(&user.id);
            let _ = writeln!(
                body,
                "<p>Signed in as {}. <a href=\"/dashboard\">Open your tasks</a></p>",
                escape_html(who)
            );
        }
        None => body.push_str(
            "<p>Keep track of what needs doing.</p>\n\
             <form method=\"post\" action=\"/auth/signin\"><button type=\"submit\">Sign in</button></form>\n",
        ),
    }
    layout("TaskDesk", &body)
}

fn task_item(task: &Task) -> String {
    let id = escape_html(task.id.as_str());
    let done = task.status == TaskStatus::Completed;
    let mut meta = vec![task.status.as_str().replace('_', " ")];
    if let Some(priority) = task.priority {
        meta.push(format!("{} priority", priority.as_str()));
    }
    if let Some(due) = task.due_date.as_deref() {
        meta.push(format!("due {}", escape_html(due)));
    }
    format!(
        "<li>\
         <form method=\"post\" action=\"/tasks/{id}/toggle\">\
         <button type=\"submit\" aria-label=\"Toggle task\">{}</button></form>\
         <span class=\"{}\">{}</span> <span class=\"meta\">{}</span>\
         <form method=\"post\" action=\"/tasks/{id}/delete\">\
         <button type=\"submit\" aria-label=\"Delete task\">Delete</button></form>\
         </li>\n",
        if done { "&#9745;" } else { "&#9744;" },
        if done { "done" } else { "open" },
        escape_html(&task.name),
        meta.join(" &middot; "),
    )
}

pub fn dashboard_page(user: &AuthUser, tasks: &TaskList, flash: Option<&str>) -> String {
    let who = user.email.as_deref().unwrap_or(&user.id);
    let mut body = format!(
        "<h1>Your tasks</h1>\n<p>Signed in as {}. <a href=\"/dashboard?refresh=true\">Refresh</a></p>\n\
         <form method=\"post\" action=\"/auth/signout\"><button type=\"submit\">Sign out</button></form>\n",
        escape_html(who)
    );
    if let Some(message) = flash {
        push_alert(&mut body, message);
    }
    body.push_str(
        "<form method=\"post\" action=\"/tasks\">\
         <input name=\"name\" placeholder=\"Add a task\" autocomplete=\"off\">\
         <button type=\"submit\">Add</button></form>\n",
    );
    if tasks.is_empty() {
        body.push_str("<p>No tasks yet.</p>\n");
    } else {
        body.push_str("<ul>\n");
        for task in tasks.as_slice() {
            body.push_str(&task_item(task));
        }
        body.push_str("</ul>\n");
    }
    layout("Your tasks", &body)
}

pub fn error_page(message: &str) -> String {
    layout(
        "Error",
        &format!(
            "<h1>Something went wrong</h1>\n<p class=\"error\">{}</p>\n<p><a href=\"/\">Back</a></p>\n",
            escape_html(message)
        ),
    )
}
